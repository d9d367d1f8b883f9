//! Device image compatibility checks.

/// ELF machine id for CUDA device code.
pub const EM_CUDA: u16 = 190;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const ET_OFFSET_MACHINE: usize = 18;
const ELF32_EHDR_SIZE: usize = 52;
const ELF64_EHDR_SIZE: usize = 64;

/// Yes/no compatibility query for device images.
pub trait ImageValidator: Send + Sync {
    /// Returns true when `image` can be loaded by this backend.
    ///
    /// Must never panic; malformed input is reported as `false`.
    fn is_compatible(&self, image: &[u8]) -> bool;
}

/// Accepts ELF images whose header names a given machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfMachineValidator {
    machine: u16,
}

impl Default for ElfMachineValidator {
    fn default() -> Self {
        Self::new(EM_CUDA)
    }
}

impl ElfMachineValidator {
    /// Validator accepting `machine`.
    #[must_use]
    pub fn new(machine: u16) -> Self {
        Self { machine }
    }

    /// Machine id accepted by this validator.
    #[must_use]
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// Read `e_machine` from an ELF header, or `None` if the header is malformed.
    #[must_use]
    pub fn machine_of(image: &[u8]) -> Option<u16> {
        if image.len() < ELF_MAGIC.len() || image[..4] != ELF_MAGIC {
            tracing::debug!("Unable to get ELF handle: bad magic");
            return None;
        }

        let header_size = match image.get(EI_CLASS) {
            Some(&ELFCLASS32) => ELF32_EHDR_SIZE,
            Some(&ELFCLASS64) => ELF64_EHDR_SIZE,
            other => {
                tracing::debug!(class = ?other, "Unable to get machine ID from ELF file: unknown class");
                return None;
            }
        };

        if image.len() < header_size {
            tracing::debug!(
                len = image.len(),
                header_size,
                "Unable to get machine ID from ELF file: truncated header"
            );
            return None;
        }

        let raw = [image[ET_OFFSET_MACHINE], image[ET_OFFSET_MACHINE + 1]];
        match image[EI_DATA] {
            ELFDATA2LSB => Some(u16::from_le_bytes(raw)),
            ELFDATA2MSB => Some(u16::from_be_bytes(raw)),
            other => {
                tracing::debug!(encoding = other, "Unexpected ELF data encoding");
                None
            }
        }
    }
}

impl ImageValidator for ElfMachineValidator {
    fn is_compatible(&self, image: &[u8]) -> bool {
        match Self::machine_of(image) {
            Some(machine) if machine == self.machine => true,
            Some(machine) => {
                tracing::debug!(
                    machine,
                    expected = self.machine,
                    "Image targets a different machine"
                );
                false
            }
            None => false,
        }
    }
}

/// Build a minimal ELF header for `machine`, followed by `payload`.
///
/// Used by the simulated driver and tests to produce images that pass
/// [`ElfMachineValidator`].
#[must_use]
pub fn elf_image(machine: u16, payload: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; ELF64_EHDR_SIZE];
    image[..4].copy_from_slice(&ELF_MAGIC);
    image[EI_CLASS] = ELFCLASS64;
    image[EI_DATA] = ELFDATA2LSB;
    image[6] = 1; // EI_VERSION
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[ET_OFFSET_MACHINE..ET_OFFSET_MACHINE + 2].copy_from_slice(&machine.to_le_bytes());
    image[52..54].copy_from_slice(&(ELF64_EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    image.extend_from_slice(payload);
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_cuda_elf() {
        let validator = ElfMachineValidator::default();
        assert!(validator.is_compatible(&elf_image(EM_CUDA, b"cubin")));
    }

    #[test]
    fn test_rejects_other_machine() {
        let validator = ElfMachineValidator::default();
        // EM_X86_64
        assert!(!validator.is_compatible(&elf_image(62, b"")));
    }

    #[test]
    fn test_rejects_malformed() {
        let validator = ElfMachineValidator::default();
        assert!(!validator.is_compatible(&[]));
        assert!(!validator.is_compatible(b"\x7fEL"));
        assert!(!validator.is_compatible(b"not an elf image at all"));

        let mut truncated = elf_image(EM_CUDA, b"");
        truncated.truncate(40);
        assert!(!validator.is_compatible(&truncated));

        let mut bad_class = elf_image(EM_CUDA, b"");
        bad_class[EI_CLASS] = 9;
        assert!(!validator.is_compatible(&bad_class));

        let mut bad_encoding = elf_image(EM_CUDA, b"");
        bad_encoding[EI_DATA] = 0;
        assert!(!validator.is_compatible(&bad_encoding));
    }

    #[test]
    fn test_elf32_and_big_endian_headers() {
        let mut image = vec![0u8; ELF32_EHDR_SIZE];
        image[..4].copy_from_slice(&ELF_MAGIC);
        image[EI_CLASS] = ELFCLASS32;
        image[EI_DATA] = ELFDATA2MSB;
        image[ET_OFFSET_MACHINE..ET_OFFSET_MACHINE + 2].copy_from_slice(&EM_CUDA.to_be_bytes());

        assert_eq!(ElfMachineValidator::machine_of(&image), Some(EM_CUDA));
        assert!(ElfMachineValidator::default().is_compatible(&image));
    }

    #[test]
    fn test_custom_machine() {
        let validator = ElfMachineValidator::new(224); // EM_AMDGPU
        assert_eq!(validator.machine(), 224);
        assert!(validator.is_compatible(&elf_image(224, b"")));
        assert!(!validator.is_compatible(&elf_image(EM_CUDA, b"")));
    }
}
