// SPDX-License-Identifier: MIT

//! Lossless delta + run-length codec for numeric time series.
//!
//! An activity stream like elapsed time is mostly monotone with long
//! stretches of identical sampling intervals, so storing consecutive
//! differences and collapsing repeated differences into `(delta, count)`
//! runs shrinks it dramatically while staying exactly reversible.
//!
//! The encoded form is a token list whose first element is the literal
//! first absolute value; everything after it is a delta token. Decoding
//! takes the delta tokens plus the explicit first value and reconstructs
//! the original sequence bit-for-bit.

use serde::{Deserialize, Serialize};

/// Minimum run length that gets collapsed into a `(delta, count)` pair.
/// Two-long runs are emitted as two literals; this must be consistent
/// across all encoders because it changes the stored bytes (decoding
/// accepts both forms regardless).
const MIN_RUN_LEN: usize = 3;

/// One element of an encoded stream: a literal delta, or a run of equal
/// deltas. Serializes to the wire shape used by stored documents: bare
/// integer for a literal, two-element `[delta, count]` array for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Token {
    Lit(i64),
    Run(i64, u32),
}

/// Codec failures. Callers treat these as "no usable stream", not as
/// hard errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("cannot encode an empty stream")]
    EmptyStream,

    #[error("run length overflows u32")]
    RunOverflow,
}

/// Encode a sequence as `[first_value, delta tokens...]`.
///
/// Consecutive differences are computed and greedy grouping collapses
/// runs of `MIN_RUN_LEN` or more equal differences into a single
/// `Token::Run`. Empty input is an error; the caller must special-case
/// it as "no stream".
pub fn encode(values: &[i64]) -> Result<Vec<Token>, CodecError> {
    let (&first, rest) = values.split_first().ok_or(CodecError::EmptyStream)?;

    let mut encoded = Vec::with_capacity(values.len());
    encoded.push(Token::Lit(first));

    let mut prev = first;
    // (current delta, occurrences so far)
    let mut run: Option<(i64, usize)> = None;

    for &v in rest {
        let delta = v.wrapping_sub(prev);
        prev = v;

        match run {
            Some((d, n)) if d == delta => run = Some((d, n + 1)),
            Some((d, n)) => {
                flush_run(&mut encoded, d, n)?;
                run = Some((delta, 1));
            }
            None => run = Some((delta, 1)),
        }
    }

    if let Some((d, n)) = run {
        flush_run(&mut encoded, d, n)?;
    }

    Ok(encoded)
}

fn flush_run(encoded: &mut Vec<Token>, delta: i64, len: usize) -> Result<(), CodecError> {
    if len >= MIN_RUN_LEN {
        let count = u32::try_from(len).map_err(|_| CodecError::RunOverflow)?;
        encoded.push(Token::Run(delta, count));
    } else {
        for _ in 0..len {
            encoded.push(Token::Lit(delta));
        }
    }
    Ok(())
}

/// Decode delta tokens back into the original sequence, starting from
/// the explicit first absolute value.
///
/// Accepts runs of any length, including the short runs the encoder
/// never emits, so streams written under the older run threshold still
/// decode correctly.
pub fn decode(tokens: &[Token], first_value: i64) -> Vec<i64> {
    let mut out = Vec::with_capacity(tokens.len() + 1);
    out.push(first_value);

    let mut running = first_value;
    for token in tokens {
        match *token {
            Token::Lit(delta) => {
                running = running.wrapping_add(delta);
                out.push(running);
            }
            Token::Run(delta, count) => {
                for _ in 0..count {
                    running = running.wrapping_add(delta);
                    out.push(running);
                }
            }
        }
    }

    out
}
