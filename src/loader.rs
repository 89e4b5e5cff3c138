//! Loaded code images: the bytes of a binary laid out at their load addresses.

use std::{collections::BTreeMap, fs, path::Path};

use object::{
    elf::{PF_W, PF_X},
    File, Object, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind, SegmentFlags,
};
use tracing::{event, Level};

use crate::error::SynthError;

/// One contiguous mapped region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub base_address: u64,
    pub data: Vec<u8>,
    pub executable: bool,
    pub writable: bool,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.base_address.wrapping_add(self.data.len() as u64)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.end()
    }
}

/// A binary as it would be mapped at runtime.
#[derive(Clone, Debug, Default)]
pub struct Image {
    name: String,
    segments: Vec<Segment>,
    symbols: BTreeMap<String, u64>,
}

fn flags_of(flags: SegmentFlags) -> (bool, bool) {
    match flags {
        SegmentFlags::Elf { p_flags } => (p_flags & PF_X != 0, p_flags & PF_W != 0),
        SegmentFlags::None => (true, true),
        _ => (false, false),
    }
}

impl Image {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SynthError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let data = fs::read(path).map_err(|e| SynthError::Binary { path: name.clone(), reason: e.to_string() })?;
        Self::parse(name, &data)
    }

    /// Parse an object file held in memory.
    pub fn parse(name: String, data: &[u8]) -> Result<Self, SynthError> {
        let binary_error = |reason: String| SynthError::Binary { path: name.clone(), reason };
        let file = File::parse(data).map_err(|e| binary_error(e.to_string()))?;
        let mut segments = Vec::new();
        for segment in file.segments() {
            let bytes = segment.data().map_err(|e| binary_error(e.to_string()))?;
            if segment.size() == 0 {
                continue;
            }
            let (executable, writable) = flags_of(segment.flags());
            let mut data = bytes.to_vec();
            // zero-filled tail (.bss)
            data.resize(segment.size() as usize, 0);
            segments.push(Segment { base_address: segment.address(), data, executable, writable });
        }
        if segments.is_empty() {
            // Relocatable objects have no program headers; fall back to sections.
            for section in file.sections() {
                let executable = section.kind() == SectionKind::Text;
                let writable = matches!(section.kind(), SectionKind::Data | SectionKind::UninitializedData);
                if !(executable || writable || section.kind() == SectionKind::ReadOnlyData) {
                    continue;
                }
                let data = section.uncompressed_data().map_err(|e| binary_error(e.to_string()))?;
                segments.push(Segment {
                    base_address: section.address(),
                    data: data.into_owned(),
                    executable,
                    writable,
                });
            }
        }
        let symbols = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter_map(|s| s.name().ok().filter(|n| !n.is_empty()).map(|n| (n.to_string(), s.address())))
            .collect();
        event!(Level::DEBUG, "loaded {} with {} segments", name, segments.len());
        Ok(Self { name, segments, symbols })
    }

    /// A single executable region holding `bytes` at `base_address`.
    ///
    /// `_start` names its first byte.
    pub fn from_raw<S: Into<String>>(name: S, base_address: u64, bytes: &[u8]) -> Self {
        let mut symbols = BTreeMap::new();
        symbols.insert("_start".to_string(), base_address);
        Self {
            name: name.into(),
            segments: vec![Segment { base_address, data: bytes.to_vec(), executable: true, writable: false }],
            symbols,
        }
    }

    /// Map an additional region.
    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn with_symbol<S: Into<String>>(mut self, name: S, address: u64) -> Self {
        self.symbols.insert(name.into(), address);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shift every address by `offset`.
    pub fn rebase(&mut self, offset: u64) {
        for segment in &mut self.segments {
            segment.base_address = segment.base_address.wrapping_add(offset);
        }
        for address in self.symbols.values_mut() {
            *address = address.wrapping_add(offset);
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn executable_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.executable)
    }

    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// The `len` bytes at `address`, if one region maps all of them.
    pub fn read_bytes(&self, address: u64, len: usize) -> Option<&[u8]> {
        let segment = self.segments.iter().find(|s| s.contains(address))?;
        let start = (address - segment.base_address) as usize;
        segment.data.get(start..start.checked_add(len)?)
    }

    /// Everything mapped from `address` to the end of its region.
    pub fn bytes_from(&self, address: u64) -> Option<&[u8]> {
        let segment = self.segments.iter().find(|s| s.contains(address))?;
        Some(&segment.data[(address - segment.base_address) as usize..])
    }

    pub fn is_mapped(&self, address: u64) -> bool {
        self.segments.iter().any(|s| s.contains(address))
    }

    /// One past the highest mapped address.
    pub fn max_address(&self) -> u64 {
        self.segments.iter().map(Segment::end).max().unwrap_or(0)
    }

    pub fn min_address(&self) -> u64 {
        self.segments.iter().map(|s| s.base_address).min().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_images_read_and_rebase() {
        let mut image = Image::from_raw("raw", 0x1000, &[0x5f, 0xc3]);
        assert_eq!(image.read_bytes(0x1000, 2), Some(&[0x5f, 0xc3][..]));
        assert_eq!(image.read_bytes(0x1001, 2), None);
        image.rebase(0x4000);
        assert_eq!(image.symbol("_start"), Some(0x5000));
        assert_eq!(image.bytes_from(0x5001), Some(&[0xc3][..]));
        assert_eq!(image.max_address(), 0x5002);
        assert!(!image.is_mapped(0x1000));
    }

    #[test]
    fn garbage_is_not_a_binary() {
        assert!(matches!(
            Image::parse("junk".into(), b"not an object file"),
            Err(SynthError::Binary { .. })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        match Image::from_file("/nonexistent/binary") {
            Err(SynthError::Binary { path, .. }) => assert_eq!(path, "/nonexistent/binary"),
            other => panic!("unexpected {:?}", other.map(|i| i.name().to_string())),
        }
    }
}
