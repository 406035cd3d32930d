use crate::error::AppError;

/// Function to parse size with units
pub fn parse_size(size_str: &str) -> Result<u64, AppError> {
    let size_str = size_str.trim().to_lowercase();

    if size_str.is_empty() {
        return Err(AppError::ParseError("Invalid format: empty string".to_string()));
    }

    // Split the numeric part and the unit
    let split = size_str
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size_str.len());
    let (numeric_part, unit_part) = size_str.split_at(split);

    // No unit means bytes
    if unit_part.is_empty() {
        return numeric_part
            .parse::<u64>()
            .map_err(|_| AppError::ParseError(format!("Invalid number: '{numeric_part}'")));
    }

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid number: '{numeric_part}'")))?;

    let multiplier = match unit_part.trim() {
        "b" => 1.0,
        "kb" | "k" => 1024.0,
        "mb" | "m" => 1024.0 * 1024.0,
        "gb" | "g" => 1024.0 * 1024.0 * 1024.0,
        other => return Err(AppError::ParseError(format!("Invalid unit: '{other}'"))),
    };
    Ok((value * multiplier) as u64)
}

/// Convert bytes to a human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_size(" 1.5 MB ").unwrap(), 3 * 512 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
