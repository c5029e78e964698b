//! Booking reference codes.
//!
//! A reference is the capability a patient holds for self-service
//! cancellation, so it is short enough to read over the phone and avoids
//! characters that are easy to confuse (`0`/`O`, `1`/`I`).

use rand::Rng;

pub const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 8;

/// Draws `length` characters uniformly from `alphabet`.
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R, alphabet: &[u8], length: usize) -> String {
    (0..length)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Trims and uppercases user input so it can be compared to stored codes.
pub fn normalize(reference: &str) -> String {
    reference.trim().to_uppercase()
}

/// Source of candidate codes. Uniqueness is checked by the store, not here.
pub trait CodeSource: Send + Sync {
    fn next_code(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodes;

impl CodeSource for RandomCodes {
    fn next_code(&self) -> String {
        generate_code(&mut rand::thread_rng(), ALPHABET, CODE_LENGTH)
    }
}
