#![no_main]
use libfuzzer_sys::fuzz_target;
use voltaic::protocol::ElementKind;

const KINDS: &[ElementKind] = &[
    ElementKind::UnsignedWord,
    ElementKind::SignedWord,
    ElementKind::UnsignedDoubleword,
    ElementKind::SignedDoubleword,
    ElementKind::FloatDoubleword,
    ElementKind::BitsWord,
    ElementKind::Dummy { length: 3 },
];

fuzz_target!(|data: &[u8]| {
    // Interpret the input as u16 register stream in big-endian pairs
    let regs: Vec<u16> = data
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect();

    // Walk the stream with every element type, including short tails
    for kind in KINDS {
        for window in regs.windows(usize::from(kind.length()).max(1)) {
            if let Ok(Some(value)) = kind.decode(window) {
                let _ = kind.encode(&value);
            }
        }
        let _ = kind.decode(&regs[..regs.len().min(1)]);
    }
});
