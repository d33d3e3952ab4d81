//! Parsing of credential files.
//!
//! Operators drop secrets into a text file in whatever shape their tooling
//! produced: one per line, comma separated, or several `Bearer` tokens run
//! together on one line.

/// Secrets at or below this length are treated as noise.
const MIN_SECRET_LEN: usize = 50;

const BEARER_PREFIX: &str = "Bearer ";

/// Extracts credential secrets from file content.
///
/// A leading `Bearer ` prefix is stripped from every secret.
pub fn parse_credentials(content: &str) -> Vec<String> {
    let normalized = content.trim().replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let candidates: Vec<String> = if lines.len() > 1 {
        lines.iter().flat_map(|line| parse_line(line)).collect()
    } else {
        let line = lines.first().copied().unwrap_or(normalized.as_str());
        parse_line(line)
    };

    candidates
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| c.len() > MIN_SECRET_LEN)
        .map(|c| match c.strip_prefix(BEARER_PREFIX) {
            Some(stripped) => stripped.to_string(),
            None => c,
        })
        .collect()
}

fn parse_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();

    if line.contains(',') {
        tokens.extend(
            line.split(',')
                .map(str::trim)
                .filter(|part| part.len() > MIN_SECRET_LEN)
                .map(str::to_string),
        );
    } else if line.contains(' ') && !line.starts_with(BEARER_PREFIX) {
        // Re-join words until the next `Bearer` keyword starts a new token
        let mut current = String::new();
        for part in line.split_whitespace() {
            if part == "Bearer" && !current.is_empty() {
                if current.trim().len() > MIN_SECRET_LEN {
                    tokens.push(current.trim().to_string());
                }
                current = "Bearer".to_string();
            } else if current.is_empty() {
                current = part.to_string();
            } else {
                current.push(' ');
                current.push_str(part);
            }
        }
        if current.trim().len() > MIN_SECRET_LEN {
            tokens.push(current.trim().to_string());
        }
    }

    if tokens.is_empty() && line.trim().len() > MIN_SECRET_LEN {
        tokens.push(line.trim().to_string());
    }

    tokens
}
