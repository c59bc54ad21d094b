//! Systematic Reed-Solomon erasure coding over GF(2^8).
//!
//! Source shards are transmitted unmodified; parity shards are linear
//! combinations under a Cauchy generator matrix. Because every square
//! submatrix of a Cauchy matrix is nonsingular, any `k` surviving
//! shards out of `k + m` reconstruct the originals exactly. This gives
//! strictly better loss coverage than XOR parity at the same overhead:
//! `m` parity shards tolerate any `m` losses within a frame, not just
//! one.
//!
//! Shard count is bounded by the field size: `k + m <= 256`.

use crate::error::BeamError;

/// Maximum total shards (source + parity) per frame.
pub const MAX_SHARDS: usize = 256;

// ── GF(2^8) arithmetic ───────────────────────────────────────────
//
// Multiplication via exp/log tables for the field generated by
// x^8 + x^4 + x^3 + x^2 + 1 (0x11D), generator 2. The exp table is
// doubled so `exp[log[a] + log[b]]` never needs a modulo.

const fn build_tables() -> ([u8; 512], [u8; 256]) {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= 0x11D;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    (exp, log)
}

const TABLES: ([u8; 512], [u8; 256]) = build_tables();
const EXP: [u8; 512] = TABLES.0;
const LOG: [u8; 256] = TABLES.1;

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        0
    } else {
        EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
    }
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0, "zero has no inverse");
    EXP[255 - LOG[a as usize] as usize]
}

/// Generator coefficient for parity row `j` over source column `i`.
///
/// Cauchy construction with disjoint index sets `x_j = k + j` and
/// `y_i = i`, so `x_j ^ y_i` is never zero.
#[inline]
fn cauchy(k: usize, j: usize, i: usize) -> u8 {
    gf_inv(((k + j) ^ i) as u8)
}

// ── Encoding ─────────────────────────────────────────────────────

/// Compute `m` parity shards over equally sized source shards.
///
/// # Panics
///
/// Panics if the sources are not all the same length or if
/// `sources.len() + m` exceeds [`MAX_SHARDS`].
pub fn encode_parity(sources: &[&[u8]], m: usize) -> Vec<Vec<u8>> {
    let k = sources.len();
    assert!(k > 0, "at least one source shard required");
    assert!(k + m <= MAX_SHARDS, "too many shards for GF(2^8)");
    let len = sources[0].len();
    assert!(
        sources.iter().all(|s| s.len() == len),
        "source shards must be equally sized"
    );

    let mut parity = vec![vec![0u8; len]; m];
    for (j, out) in parity.iter_mut().enumerate() {
        for (i, src) in sources.iter().enumerate() {
            let coeff = cauchy(k, j, i);
            for (o, s) in out.iter_mut().zip(*src) {
                *o ^= gf_mul(coeff, *s);
            }
        }
    }
    parity
}

// ── Reconstruction ───────────────────────────────────────────────

/// Fill in missing source shards from any `k` survivors.
///
/// `shards` holds all `k + m` slots in wire order (sources first,
/// then parity); lost shards are `None`. On success every source slot
/// `0..k` is `Some`. Parity slots are left untouched.
pub fn reconstruct(k: usize, shards: &mut [Option<Vec<u8>>]) -> Result<(), BeamError> {
    assert!(k > 0 && k <= shards.len());
    if shards[..k].iter().all(Option::is_some) {
        return Ok(());
    }

    let present: Vec<usize> = shards
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.is_some().then_some(i))
        .take(k)
        .collect();
    if present.len() < k {
        return Err(BeamError::InsufficientShards {
            have: present.len(),
            need: k,
        });
    }

    // Rows of the systematic generator matrix for the surviving
    // shards: identity rows for sources, Cauchy rows for parity.
    let mut matrix = vec![vec![0u8; k]; k];
    for (row, &idx) in matrix.iter_mut().zip(&present) {
        if idx < k {
            row[idx] = 1;
        } else {
            for (i, cell) in row.iter_mut().enumerate() {
                *cell = cauchy(k, idx - k, i);
            }
        }
    }
    let inverse = invert(matrix)?;

    let len = shards[present[0]].as_ref().map(Vec::len).unwrap_or(0);
    let missing: Vec<usize> = (0..k).filter(|&i| shards[i].is_none()).collect();
    for s in missing {
        let mut out = vec![0u8; len];
        for (i, &idx) in present.iter().enumerate() {
            let coeff = inverse[s][i];
            if coeff == 0 {
                continue;
            }
            let data = shards[idx].as_ref().ok_or(BeamError::InsufficientShards {
                have: 0,
                need: k,
            })?;
            if data.len() != len {
                return Err(BeamError::InvalidHeader("shard length mismatch"));
            }
            for (o, d) in out.iter_mut().zip(data) {
                *o ^= gf_mul(coeff, *d);
            }
        }
        shards[s] = Some(out);
    }
    Ok(())
}

/// Gauss-Jordan inversion over GF(2^8).
fn invert(mut matrix: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, BeamError> {
    let n = matrix.len();
    let mut inv: Vec<Vec<u8>> = (0..n)
        .map(|i| {
            let mut row = vec![0u8; n];
            row[i] = 1;
            row
        })
        .collect();

    for col in 0..n {
        // The Cauchy construction guarantees a pivot exists; the error
        // path only fires on corrupted shard indexing.
        let pivot = (col..n)
            .find(|&r| matrix[r][col] != 0)
            .ok_or(BeamError::InvalidHeader("singular recovery matrix"))?;
        matrix.swap(col, pivot);
        inv.swap(col, pivot);

        let scale = gf_inv(matrix[col][col]);
        for cell in matrix[col].iter_mut() {
            *cell = gf_mul(*cell, scale);
        }
        for cell in inv[col].iter_mut() {
            *cell = gf_mul(*cell, scale);
        }

        for row in 0..n {
            if row == col || matrix[row][col] == 0 {
                continue;
            }
            let factor = matrix[row][col];
            for i in 0..n {
                let a = gf_mul(factor, matrix[col][i]);
                matrix[row][i] ^= a;
                let b = gf_mul(factor, inv[col][i]);
                inv[row][i] ^= b;
            }
        }
    }
    Ok(inv)
}

// ── Tests ────────────────────────────────────────────────────────
