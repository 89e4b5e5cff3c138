//! The TOML document a run is configured by.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};

use crate::{
    error::{ConfigError, SynthError},
    gadget::GadgetLibrary,
    synthesis::builder::SynthesisParams,
};

pub mod constraint;
pub mod library;
pub mod meta;
pub mod sleigh;
pub mod specification;
pub mod synthesis;

use self::{
    constraint::ConstraintConfig,
    library::GadgetLibraryConfig,
    meta::MetaConfig,
    sleigh::SleighConfig,
    specification::{BinaryFileSpecification, SpecificationConfig},
    synthesis::SynthesisConfig,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SynthConfig {
    #[serde(default)]
    pub meta: MetaConfig,
    pub specification: SpecificationConfig,
    pub library: GadgetLibraryConfig,
    #[serde(default)]
    pub sleigh: SleighConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    pub constraint: Option<ConstraintConfig>,
}

impl SynthConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.library.validate()?;
        config.synthesis.validate()?;
        Ok(config)
    }

    /// A starting point for `new`: the library binary doubles as the reference.
    pub fn template(library_path: &str) -> Self {
        Self {
            meta: MetaConfig::default(),
            specification: SpecificationConfig::BinaryFile(BinaryFileSpecification::new("reference.o", 1)),
            library: GadgetLibraryConfig::new(library_path),
            sleigh: SleighConfig::default(),
            synthesis: SynthesisConfig::default(),
            constraint: Some(ConstraintConfig::default()),
        }
    }

    /// Build the library, compile the reference program and constraints.
    ///
    /// Nothing is solved yet; the result can still be extended with custom
    /// constraints before it runs.
    #[instrument(skip_all)]
    pub fn resolve(&self) -> Result<SynthesisParams, SynthError> {
        let semantics = self.sleigh.semantics()?;
        let library = GadgetLibrary::build(&self.library, semantics.clone(), self.meta.rng_seed())?;
        let reference = self.specification.compile(&semantics)?;
        let constraints = self.constraint.clone().unwrap_or_default().compile(semantics.arch())?;
        event!(Level::INFO, "resolved {} gadgets against {} reference instructions", library.len(), reference.len());
        let params = SynthesisParams::new(library, reference)
            .with_constraints(constraints)
            .seed(self.meta.rng_seed())
            .strategy(self.synthesis.strategy)
            .candidates_per_slot(self.synthesis.max_candidates_per_slot)
            .parallel(self.synthesis.parallel)
            .combine_instructions(self.synthesis.combine_instructions)
            .timeout_ms(self.synthesis.timeout_ms);
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::meta::LogLevel, synthesis::builder::SynthesisSelectionStrategy};

    const MINIMAL: &str = r#"
        [meta]
        seed = 7
        log_level = "DEBUG"

        [specification]
        RawPcode = "RAX = COPY 0x3b:8"

        [library]
        path = "libc.so.6"
    "#;

    #[test]
    fn defaults_fill_optional_sections() {
        let config = SynthConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.meta.seed, 7);
        assert_eq!(config.meta.log_level, LogLevel::Debug);
        assert_eq!(config.library.max_gadget_length, 4);
        assert_eq!(config.sleigh.language_id, "x86:LE:64:default");
        assert_eq!(config.synthesis, SynthesisConfig::default());
        assert!(config.constraint.is_none());
    }

    #[test]
    fn binary_specification_and_strategy() {
        let text = r#"
            [specification.BinaryFile]
            path = "bin/execve"
            max_instructions = 5

            [library]
            path = "libc.so.6"
            max_gadget_length = 6
            loaded_libraries = [{ path = "libm.so.6" }]

            [synthesis]
            strategy = "sat"
            max_candidates_per_slot = 20
            timeout_ms = 1000
        "#;
        let config = SynthConfig::from_toml(text).unwrap();
        match &config.specification {
            SpecificationConfig::BinaryFile(spec) => {
                assert_eq!(spec.entry, "_start");
                assert_eq!(spec.max_instructions, 5);
            }
            other => panic!("unexpected specification {:?}", other),
        }
        assert_eq!(config.synthesis.strategy, SynthesisSelectionStrategy::Sat);
        assert_eq!(config.synthesis.parallel, 4);
        assert_eq!(config.synthesis.timeout_ms, Some(1000));
        assert_eq!(config.library.loaded_libraries.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn zero_values_are_rejected() {
        let text = format!("{}\n[synthesis]\nparallel = 0\n", MINIMAL);
        assert!(matches!(
            SynthConfig::from_toml(&text),
            Err(ConfigError::Invalid { field: "synthesis.parallel", .. })
        ));
    }

    #[test]
    fn template_round_trips() {
        let template = SynthConfig::template("/lib/x86_64-linux-gnu/libc.so.6");
        let text = toml::to_string(&template).unwrap();
        let parsed = SynthConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.library, template.library);
        assert_eq!(parsed.specification, template.specification);
    }
}
