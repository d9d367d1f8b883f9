//! Fuzz target for the ELF machine validator.
//!
//! The validator must never panic, and must agree with `machine_of` on
//! every input.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tgtrt_core::validator::{elf_image, ElfMachineValidator, ImageValidator, EM_CUDA};

/// Fuzz input: raw bytes, optionally behind a well-formed header.
#[derive(Debug, Arbitrary)]
struct FuzzInput {
    /// Prefix a valid ELF64 header for `machine`.
    with_header: bool,
    /// Machine id for the generated header.
    machine: u16,
    /// Remaining bytes.
    bytes: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let image = if input.with_header {
        elf_image(input.machine, &input.bytes)
    } else {
        input.bytes
    };

    let validator = ElfMachineValidator::default();
    let compatible = validator.is_compatible(&image);

    assert_eq!(
        compatible,
        ElfMachineValidator::machine_of(&image) == Some(EM_CUDA),
        "validator disagrees with header parse"
    );

    if input.with_header {
        assert_eq!(compatible, input.machine == EM_CUDA);
    }
});
