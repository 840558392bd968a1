//! Small utility helpers used across modules.

/// Canonical form of a badge/tier name for table lookups:
/// trimmed, lowercased, inner whitespace collapsed to single spaces.
pub fn normalize_name(s: &str) -> String {
  s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// "1 course" / "3 courses".
pub fn plural(n: u64, noun: &str) -> String {
  if n == 1 { format!("{} {}", n, noun) } else { format!("{} {}s", n, noun) }
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) { cut -= 1; }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}
