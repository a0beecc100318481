//! Human readable integer lists, e.g. `0-3,8,10-11`

use crate::bitmask::BitmaskError;

/// Largest integer accepted in a list. Keeps accidental huge ranges out.
pub const MAX_LIST_VALUE: u64 = 255;

/// Parse a comma separated list of integers and inclusive integer ranges
///
/// The result is sorted and deduplicated. An empty string yields an empty
/// list.
///
/// # Example
///
/// ```
/// use rdtctl_raw::parse_int_list;
///
/// assert_eq!(parse_int_list("4,0-2").unwrap(), vec![0, 1, 2, 4]);
/// ```
pub fn parse_int_list(s: &str) -> Result<Vec<u64>, BitmaskError> {
    let mut values = Vec::new();

    if s.is_empty() {
        return Ok(values);
    }

    for part in s.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_value(start, s)?;
                let end = parse_value(end, s)?;
                if end <= start {
                    return Err(BitmaskError::InvalidIntegerRange {
                        range: part.to_string(),
                        list: s.to_string(),
                    });
                }
                values.extend(start..=end);
            }
            None => values.push(parse_value(part, s)?),
        }
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_value(s: &str, list: &str) -> Result<u64, BitmaskError> {
    let trimmed = s.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BitmaskError::InvalidInteger(list.to_string()));
    }
    match trimmed.parse::<u64>() {
        Ok(v) if v <= MAX_LIST_VALUE => Ok(v),
        _ => Err(BitmaskError::InvalidInteger(list.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_list() {
        let cases: [(&str, &[u64]); 7] = [
            ("", &[]),
            ("0", &[0]),
            ("1", &[1]),
            ("0-3", &[0, 1, 2, 3]),
            ("4,2,0,6,10,8", &[0, 2, 4, 6, 8, 10]),
            ("1,3,5,7,9,11", &[1, 3, 5, 7, 9, 11]),
            ("1,3-4,10-12,8", &[1, 3, 4, 8, 10, 11, 12]),
        ];

        for (s, expected) in cases {
            assert_eq!(parse_int_list(s).unwrap(), expected, "parsing {s:?}");
        }
    }

    #[test]
    fn test_parse_int_list_invalid() {
        let invalid = [
            ",", "-", "1,", "256", "256-257", "0-256", ",12", "-4", "0-", "13-13", "14-13", "a-2",
            "b", "3-c", "1,2,,3", "1,2,3-",
        ];

        for s in invalid {
            assert!(parse_int_list(s).is_err(), "{s:?} parsed");
        }
    }
}
