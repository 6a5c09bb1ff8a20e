// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashSet;

use rand::Rng;

/// Generates a random 32-bit token, retrying until it is absent from
/// `in_use`. Tokens correlate a `TransferRequest`/`PeerInit` with its
/// eventual response and must be unique across all queued+active
/// transfers (spec.md "Token").
pub fn generate_token(in_use: &HashSet<u32>) -> u32 {
    loop {
        let candidate = rand::rng().random::<u32>();
        if !in_use.contains(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_avoids_every_in_use_value() {
        let in_use: HashSet<u32> = (0..1000).collect();
        let token = generate_token(&in_use);
        assert!(!in_use.contains(&token));
    }

    #[test]
    fn distinct_calls_usually_differ() {
        let in_use = HashSet::new();
        let a = generate_token(&in_use);
        let b = generate_token(&in_use);
        assert_ne!(a, b);
    }
}
