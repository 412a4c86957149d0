/// Resolve a dot-notation path in a `serde_json::Value`.
///
/// - `"bench_id"` → `value["bench_id"]`
/// - `"data.bench_id"` → `value["data"]["bench_id"]`
///
/// Returns `None` if any segment is missing.
pub fn resolve_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Текущее Unix-время в микросекундах.
pub fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Конвертировать unix µs в строку `YYYY-MM-DD HH:MM:SS` (UTC).
/// Использует алгоритм Howard Hinnant (civil_from_days).
pub fn datetime_from_us(us: i64) -> String {
    let secs = us.div_euclid(1_000_000);
    let days = secs.div_euclid(86400);
    let sod = secs.rem_euclid(86400);
    let z = days + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!(
        "{y:04}-{m:02}-{d:02} {:02}:{:02}:{:02}",
        sod / 3600,
        (sod % 3600) / 60,
        sod % 60
    )
}

/// MQTT topic filter matching (`+` = one level, `#` = this level and below).
///
/// Filters are assumed valid; topics starting with `$` only match filters
/// that name the `$` level explicitly.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && !filter.starts_with('$') {
        return false;
    }
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a topic name for publishing: non-empty, no wildcards, no NUL.
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}

/// Validate a subscription filter: `#` only as the whole last level,
/// `+` only as a whole level.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        l => !l.contains(['+', '#']),
    })
}

/// Сократить длинный payload для вывода: первые 100 + "..." + последние 100.
pub fn preview(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 200 {
        return text.to_string();
    }
    let head: String = chars[..100].iter().collect();
    let tail: String = chars[chars.len() - 100..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_level_wildcard_matches_subtree() {
        assert!(topic_matches("/ge/web/#", "/ge/web/ab12cd34"));
        assert!(topic_matches("/ge/web/#", "/ge/web/ab12cd34/device_3"));
        assert!(topic_matches("/ge/web/#", "/ge/web"));
        assert!(!topic_matches("/ge/web/#", "/gc/web/ab12cd34"));
    }

    #[test]
    fn single_level_wildcard_matches_one_level() {
        assert!(topic_matches("/ge/+/dev", "/ge/web/dev"));
        assert!(!topic_matches("/ge/+/dev", "/ge/web/x/dev"));
        assert!(!topic_matches("/ge/+", "/ge"));
    }

    #[test]
    fn system_topics_need_explicit_prefix() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn filter_validation() {
        assert!(valid_filter("/ge/web/#"));
        assert!(valid_filter("+/x/+"));
        assert!(!valid_filter("/ge/#/x"));
        assert!(!valid_filter("/ge/we+b"));
        assert!(!valid_filter(""));
        assert!(valid_topic("/ge/web/a1"));
        assert!(!valid_topic("/ge/web/#"));
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = "a".repeat(150) + &"b".repeat(150);
        let p = preview(&long);
        assert_eq!(p.len(), 203);
        assert!(p.starts_with(&"a".repeat(100)));
        assert!(p.ends_with(&"b".repeat(100)));
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn datetime_formatting() {
        assert_eq!(datetime_from_us(0), "1970-01-01 00:00:00");
        // 2026-02-15 20:00:00 UTC
        assert_eq!(datetime_from_us(1_771_185_600_000_000), "2026-02-15 20:00:00");
    }

    #[test]
    fn resolve_nested_path() {
        let v = serde_json::json!({"data": {"bench_id": "x1"}});
        assert_eq!(resolve_path(&v, "data.bench_id").and_then(|v| v.as_str()), Some("x1"));
        assert!(resolve_path(&v, "bench_id").is_none());
    }
}
