//! N-gram tables for repetition blocking.

use std::collections::HashMap;

/// Maps every `(n-1)`-token prefix seen in `tokens` to the tokens that followed it.
pub(crate) fn ngram_table(tokens: &[u32], n: usize) -> HashMap<&[u32], Vec<u32>> {
    let mut table: HashMap<&[u32], Vec<u32>> = HashMap::new();
    if n == 0 {
        return table;
    }
    for window in tokens.windows(n) {
        let (prefix, next) = window.split_at(n - 1);
        table.entry(prefix).or_default().push(next[0]);
    }
    table
}

/// Tokens that would complete an n-gram of `table` given the trailing
/// `(n-1)` tokens of `history`.
pub(crate) fn banned_tokens(table: &HashMap<&[u32], Vec<u32>>, history: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || history.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &history[history.len() + 1 - n..];
    table.get(prefix).cloned().unwrap_or_default()
}

/// Tokens that would repeat an n-gram already present in `history`.
pub(crate) fn banned_repeat_tokens(history: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || history.len() + 1 < n {
        return Vec::new();
    }
    let table = ngram_table(history, n);
    banned_tokens(&table, history, n)
}
