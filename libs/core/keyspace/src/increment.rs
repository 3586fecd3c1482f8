// [libs/core/keyspace/src/increment.rs]
//! Increment-mode decomposition: one layer per mask length, scheduled as
//! independent sub-jobs whose commands never carry `--increment*` flags.

use crate::KeyspaceError;

/// One token of a hashcat mask: a literal character or a charset reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskToken {
    Literal,
    Charset(char),
}

/// Cardinality of the built-in charsets.
fn charset_size(symbol: char) -> Result<u64, KeyspaceError> {
    match symbol {
        'l' | 'u' => Ok(26),
        'd' => Ok(10),
        's' => Ok(33),
        'a' => Ok(95),
        'b' => Ok(256),
        'h' | 'H' => Ok(16),
        other => Err(KeyspaceError::MalformedMask(format!(
            "unsupported charset ?{other}"
        ))),
    }
}

fn tokenize(mask: &str) -> Result<Vec<(MaskToken, String)>, KeyspaceError> {
    let mut tokens = Vec::new();
    let mut chars = mask.chars();
    while let Some(current) = chars.next() {
        if current == '?' {
            let Some(symbol) = chars.next() else {
                return Err(KeyspaceError::MalformedMask(
                    "dangling '?' at end of mask".to_string(),
                ));
            };
            if symbol == '?' {
                // `??` is an escaped literal question mark.
                tokens.push((MaskToken::Literal, "??".to_string()));
            } else {
                charset_size(symbol)?;
                tokens.push((MaskToken::Charset(symbol), format!("?{symbol}")));
            }
        } else {
            tokens.push((MaskToken::Literal, current.to_string()));
        }
    }
    if tokens.is_empty() {
        return Err(KeyspaceError::MalformedMask("empty mask".to_string()));
    }
    Ok(tokens)
}

/// Number of positions in a mask.
pub fn mask_token_count(mask: &str) -> Result<u32, KeyspaceError> {
    Ok(tokenize(mask)?.len() as u32)
}

/// The first `length` positions of a mask, re-rendered as mask text.
pub fn truncate_mask(mask: &str, length: u32) -> Result<String, KeyspaceError> {
    let tokens = tokenize(mask)?;
    if length == 0 || length as usize > tokens.len() {
        return Err(KeyspaceError::MalformedMask(format!(
            "length {length} outside mask of {} positions",
            tokens.len()
        )));
    }
    Ok(tokens[..length as usize]
        .iter()
        .map(|(_, text)| text.as_str())
        .collect())
}

/// Candidate count for a full mask: the product of its charset sizes.
pub fn base_keyspace_for_mask(mask: &str) -> Result<u64, KeyspaceError> {
    let mut product: u64 = 1;
    for (token, _) in tokenize(mask)? {
        let size = match token {
            MaskToken::Literal => 1,
            MaskToken::Charset(symbol) => charset_size(symbol)?,
        };
        product = product.saturating_mul(size);
    }
    Ok(product)
}

/// Expands an increment job into `(length, layer_mask)` pairs for lengths
/// `[min, max]` clamped to the mask width. `inverse` yields longest-first.
pub fn layer_masks(
    mask: &str,
    increment_min: u32,
    increment_max: u32,
    inverse: bool,
) -> Result<Vec<(u32, String)>, KeyspaceError> {
    let width = mask_token_count(mask)?;
    let lower = increment_min.max(1);
    let upper = increment_max.min(width);
    if lower > upper {
        return Err(KeyspaceError::MalformedMask(format!(
            "increment range {increment_min}..={increment_max} collapses against a {width}-position mask"
        )));
    }

    let mut layers = Vec::with_capacity((upper - lower + 1) as usize);
    for length in lower..=upper {
        layers.push((length, truncate_mask(mask, length)?));
    }
    if inverse {
        layers.reverse();
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_truncates_mixed_masks() {
        assert_eq!(mask_token_count("?l?l?d").unwrap(), 3);
        assert_eq!(mask_token_count("ab?d").unwrap(), 3);
        assert_eq!(mask_token_count("??what").unwrap(), 5);

        assert_eq!(truncate_mask("?l?u?d?d", 2).unwrap(), "?l?u");
        assert_eq!(truncate_mask("ab?d", 2).unwrap(), "ab");
        assert!(truncate_mask("?l?l", 3).is_err());
        assert!(truncate_mask("?l?l", 0).is_err());
    }

    #[test]
    fn rejects_malformed_masks() {
        assert!(tokenize("").is_err());
        assert!(tokenize("?l?").is_err());
        assert!(tokenize("?z").is_err());
    }

    #[test]
    fn base_keyspace_is_charset_product() {
        assert_eq!(base_keyspace_for_mask("?l?l").unwrap(), 676);
        assert_eq!(base_keyspace_for_mask("?d?d?d").unwrap(), 1000);
        assert_eq!(base_keyspace_for_mask("a?d").unwrap(), 10);
        assert_eq!(base_keyspace_for_mask("?b").unwrap(), 256);
    }

    #[test]
    fn layers_cover_the_clamped_range() {
        let layers = layer_masks("?l?l?l?l", 2, 6, false).unwrap();
        assert_eq!(
            layers,
            vec![
                (2, "?l?l".to_string()),
                (3, "?l?l?l".to_string()),
                (4, "?l?l?l?l".to_string()),
            ]
        );

        let inverse = layer_masks("?l?l?l?l", 2, 4, true).unwrap();
        assert_eq!(inverse.first().unwrap().0, 4);
        assert_eq!(inverse.last().unwrap().0, 2);

        assert!(layer_masks("?l?l", 3, 4, false).is_err());
    }

    #[test]
    fn layer_keyspaces_sum_to_increment_total() {
        // Invariant: the job's effective keyspace is the sum of its layers.
        let layers = layer_masks("?d?d?d", 1, 3, false).unwrap();
        let total: u64 = layers
            .iter()
            .map(|(_, mask)| base_keyspace_for_mask(mask).unwrap())
            .sum();
        assert_eq!(total, 10 + 100 + 1000);
    }
}
