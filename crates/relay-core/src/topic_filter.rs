// topic_filter.rs - MQTT-style topic filter matching.
//
// Filters are split on `/` and compared level by level:
//   "+"  matches exactly one level
//   "#"  matches the rest of the topic (must be the last level)
//
// Examples:
//   "/parameter/update/+" → matches "/parameter/update/01234"
//   "/parameter/#"        → matches "/parameter/update/01234"
//   "/parameter/update/+" → does NOT match "/parameter/update/1/extra"

/// Match `topic` against an MQTT topic filter. Invalid filters never match.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if !is_valid_filter(filter) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether some topic matches both filters. Invalid filters never overlap.
pub fn filters_overlap(a: &str, b: &str) -> bool {
    if !is_valid_filter(a) || !is_valid_filter(b) {
        return false;
    }

    let mut a_levels = a.split('/');
    let mut b_levels = b.split('/');

    loop {
        match (a_levels.next(), b_levels.next()) {
            (Some("#"), _) | (_, Some("#")) => return true,
            (Some("+"), Some(_)) | (Some(_), Some("+")) => {}
            (Some(x), Some(y)) if x == y => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A filter is valid if `#` only appears as the whole final level and `+`
/// only appears as a whole level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}
