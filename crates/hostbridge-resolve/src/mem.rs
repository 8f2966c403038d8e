//! Standardizes `max_mem` (`spec.md` §4.5: "`max_mem` -> bytes") the way
//! `expand_size` does in `original_source`: a bare integer is bytes, a
//! suffix of `K`/`M`/`G`/`T` (optionally followed by `B`, case-insensitive)
//! scales by binary powers of 1024.

pub fn parse_mem_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Ok(bytes) = s.parse::<u64>() {
        return Ok(bytes);
    }

    let (digits, suffix) = split_numeric_suffix(s);
    let value: f64 = digits.parse().map_err(|_| format!("invalid max_mem {s:?}: expected bytes or a K/M/G/T size"))?;

    let suffix = suffix.trim().to_uppercase();
    let suffix = suffix.strip_suffix('B').unwrap_or(&suffix);
    let multiplier: f64 = match suffix {
        "K" => 1024.0,
        "M" => 1024.0 * 1024.0,
        "G" => 1024.0 * 1024.0 * 1024.0,
        "T" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "" => 1.0,
        other => return Err(format!("invalid max_mem {s:?}: unknown unit {other:?}")),
    };

    Ok((value * multiplier).round() as u64)
}

fn split_numeric_suffix(s: &str) -> (&str, &str) {
    let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    s.split_at(split_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_bytes() {
        assert_eq!(parse_mem_bytes("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_gigabyte_suffix() {
        assert_eq!(parse_mem_bytes("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_mem_bytes("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parses_fractional_megabytes() {
        assert_eq!(parse_mem_bytes("1.5M").unwrap(), (1.5 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_mem_bytes("5XB").is_err());
    }
}
