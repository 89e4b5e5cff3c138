use thiserror::Error;

/// A failure to turn bytes into an instruction.
///
/// Recoverable while scanning a library: the offending address is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to lift instruction at {address:#x} ({}): {reason}", hex(.bytes))]
pub struct LiftError {
  pub address: u64,
  pub bytes: Vec<u8>,
  pub reason: String,
}

impl LiftError {
  pub fn new<S: Into<String>>(address: u64, bytes: &[u8], reason: S) -> Self {
    Self { address, bytes: bytes.to_vec(), reason: reason.into() }
  }
}

fn hex(bytes: &[u8]) -> String {
  bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("unable to read {path}: {source}")]
  Io { path: String, source: std::io::Error },
  #[error("malformed configuration: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("unsupported instruction semantics language `{0}`")]
  UnknownLanguage(String),
  #[error("unknown register `{0}`")]
  UnknownRegister(String),
  #[error("unknown address space `{0}`")]
  UnknownSpace(String),
  #[error("invalid value for {field}: {reason}")]
  Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SynthError {
  #[error(transparent)]
  Lift(#[from] LiftError),
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("no usable gadgets found in the provided binaries")]
  NoGadgetsFound,
  #[error("reference program contains a conditional branch at {address:#x}")]
  UnsupportedControlFlow { address: u64 },
  #[error("reference program is empty")]
  EmptySpecification,
  #[error("unable to load binary {path}: {reason}")]
  Binary { path: String, reason: String },
  #[error("symbol `{0}` not found")]
  MissingSymbol(String),
  #[error("address {0:#x} is not mapped by any loaded image")]
  UnmappedAddress(u64),
  #[error("malformed raw p-code on line {line}: {reason}")]
  PcodeSyntax { line: usize, reason: String },
  #[error("invalid access to `{space}` at {offset:#x}: {reason}")]
  InvalidAccess { space: String, offset: u64, reason: String },
  #[error("operand size mismatch: {0}")]
  SizeMismatch(String),
  #[error("solver returned sat without a model")]
  ModelGeneration,
  #[error("unable to evaluate `{0}` in the model")]
  ModelParsing(String),
  #[error("unable to start worker pool: {0}")]
  WorkerPool(String),
}
