//-
// Copyright (c) 2024, 2025, the mailgate authors
//
// This file is part of mailgate.
//
// mailgate is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// mailgate is distributed in the hope  that it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with mailgate. If not, see <http://www.gnu.org/licenses/>.

//! Generation of short, collision-resistant identifiers for connections and
//! messages.

use std::sync::Mutex;

use chrono::Utc;
use lazy_static::lazy_static;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};

const CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

lazy_static! {
    static ref COUNTER: Mutex<usize> = Mutex::new(0);
    static ref FALLBACK_RNG: Mutex<Option<StdRng>> = Mutex::new(None);
}

/// Seeds the PRNG used when the OS entropy source is exhausted.
///
/// Call once at startup. If the fallback is ever needed without having been
/// seeded explicitly, it is seeded lazily from the wall clock at that point.
pub fn init_fallback_rng() {
    let now = Utc::now();
    let seed = now.timestamp() as u64 * 1_000_000_000
        + now.timestamp_subsec_nanos() as u64;
    *FALLBACK_RNG.lock().unwrap() = Some(StdRng::seed_from_u64(seed));
}

/// Returns the next character of the rotating alphabet.
///
/// The lock covers both the increment and the character lookup.
fn next_counter_char() -> char {
    let mut counter = COUNTER.lock().unwrap();
    *counter = (*counter + 1) % CHARSET.len();
    CHARSET[*counter] as char
}

fn fallback_fill(buf: &mut [u8]) {
    let mut guard = FALLBACK_RNG.lock().unwrap();
    let rng = guard.get_or_insert_with(|| {
        let now = Utc::now();
        StdRng::seed_from_u64(
            now.timestamp() as u64 * 1_000_000_000
                + now.timestamp_subsec_nanos() as u64,
        )
    });
    for b in buf.iter_mut() {
        *b = CHARSET[rng.gen_range(0..CHARSET.len())];
    }
}

fn base36(mut n: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n <= 0 {
        return "0".to_owned();
    }

    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Generates a new opaque, URL-safe identifier.
///
/// The identifier combines a truncated base-36 timestamp, a random block of
/// 13 to 17 bytes, and characters drawn from a process-wide rotating
/// alphabet. Collisions are negligible across a process lifetime.
pub fn new_message_id() -> String {
    let id_length = rand::thread_rng().gen_range(13..18);

    // The first four digits of the base-36 millisecond timestamp change
    // slowly and add no entropy.
    let stamp = base36(Utc::now().timestamp_millis() + id_length as i64);
    let date_entropy = if stamp.len() > 4 { &stamp[4..] } else { "" };

    let mut key = vec![0u8; id_length];
    if OsRng.try_fill_bytes(&mut key).is_err() {
        fallback_fill(&mut key);
    }

    let mut rand_string =
        base64::encode_config(&key, base64::URL_SAFE_NO_PAD);
    if rand_string.contains('-') {
        rand_string = rand_string.replace('-', &next_counter_char().to_string());
    }
    if rand_string.contains('/') {
        rand_string = rand_string.replace('/', &next_counter_char().to_string());
    }

    format!(
        "{}{}{}{}",
        date_entropy,
        next_counter_char(),
        rand_string,
        next_counter_char(),
    )
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn id_is_ascii_and_url_safe() {
        for _ in 0..1000 {
            let id = new_message_id();
            assert!(
                id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'),
                "unexpected character in id {:?}",
                id,
            );
            assert!(id.len() >= 18, "id too short: {:?}", id);
            assert!(id.len() <= 32, "id too long: {:?}", id);
        }
    }

    #[test]
    fn ids_are_unlikely_to_collide() {
        init_fallback_rng();

        let mut seen = HashSet::new();
        for i in 0..1_000_000 {
            let id = new_message_id();
            assert!(seen.insert(id.clone()), "duplicate id {} ({})", i, id);
        }
    }

    #[test]
    fn counter_rotates_through_alphabet() {
        let mut seen = HashSet::new();
        for _ in 0..CHARSET.len() {
            seen.insert(next_counter_char());
        }
        assert_eq!(CHARSET.len(), seen.len());
    }

    #[test]
    fn base36_matches_known_values() {
        assert_eq!("0", base36(0));
        assert_eq!("z", base36(35));
        assert_eq!("10", base36(36));
        assert_eq!("rs", base36(1000));
    }
}
