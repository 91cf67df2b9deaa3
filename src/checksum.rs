pub trait Checksum {
    fn reset(&mut self);
    fn update(&mut self, bytes: &[u8]);
    fn finalize(&self) -> u32;
}

/// CRC-32 over `crc32fast`, the only checksum the file format uses.
#[derive(Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Checksum for Crc32 {
    fn reset(&mut self) {
        self.hasher = crc32fast::Hasher::new();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// CRC-32 over a meta record's bytes preceding its checksum field.
pub fn meta_crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
