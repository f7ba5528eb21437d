//! topic 路由匹配
//!
//! 路由键与绑定键均以 `.` 分隔单词：`*` 匹配恰好一个单词，`#` 匹配零个或多个单词。
//!

/// 判断 `routing_key` 是否匹配绑定模式 `pattern`
///
/// 连续的 `#` 先合并为一个，再按单词逐列推进可达集合，耗时为
/// O(模式单词数 × 路由键单词数)。
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let mut compact: Vec<&str> = Vec::new();
    for word in pattern.split('.') {
        if word == "#" && compact.last() == Some(&"#") {
            continue;
        }
        compact.push(word);
    }
    let words: Vec<&str> = routing_key.split('.').collect();

    // reachable[j]：已处理的模式前缀恰好匹配前 j 个单词
    let mut reachable = vec![false; words.len() + 1];
    reachable[0] = true;
    for token in compact {
        let mut next = vec![false; words.len() + 1];
        match token {
            "#" => {
                let mut any = false;
                for (j, slot) in next.iter_mut().enumerate() {
                    any |= reachable[j];
                    *slot = any;
                }
            }
            "*" => next[1..].copy_from_slice(&reachable[..words.len()]),
            literal => {
                for (j, word) in words.iter().enumerate() {
                    next[j + 1] = reachable[j] && *word == literal;
                }
            }
        }
        reachable = next;
    }
    reachable[words.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn literal_patterns() {
        assert!(topic_matches("mailbox.42", "mailbox.42"));
        assert!(!topic_matches("mailbox.42", "mailbox.43"));
        assert!(!topic_matches("mailbox", "mailbox.42"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(topic_matches("mailbox.*", "mailbox.42"));
        assert!(!topic_matches("mailbox.*", "mailbox"));
        assert!(!topic_matches("mailbox.*", "mailbox.42.added"));
        assert!(topic_matches("*.42", "mailbox.42"));
    }

    #[test]
    fn hash_matches_any_number_of_words() {
        assert!(topic_matches("#", "anything"));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("mailbox.#", "mailbox"));
        assert!(topic_matches("mailbox.#", "mailbox.42.added"));
        assert!(topic_matches("#.added", "mailbox.42.added"));
        assert!(!topic_matches("#.added", "mailbox.42.expunged"));
        assert!(topic_matches("a.#.z", "a.z"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(topic_matches("*.#.*", "a.b"));
        assert!(topic_matches("#.#", "a.b.c"));
        assert!(!topic_matches("*.#.*", "a"));
    }

    #[test]
    fn long_hash_patterns_match_in_bounded_time() {
        let words = vec!["a"; 128].join(".");
        let all_hashes = vec!["#"; 128].join(".");
        let anchored = format!("{}.z", vec!["#"; 126].join("."));
        assert_eq!(all_hashes.len(), 255);

        let started = Instant::now();
        assert!(topic_matches(&all_hashes, &words));
        assert!(!topic_matches(&anchored, &words));
        assert!(topic_matches(&anchored, &format!("{words}.z")));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
