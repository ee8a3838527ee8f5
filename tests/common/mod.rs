#![allow(dead_code)]

pub mod command;

use fake::Fake;
use fake::faker::lorem::en::Word;

/// Generates `count` distinct repository-like paths, some nested
pub fn generate_paths(count: usize) -> Vec<String> {
    let mut paths = std::collections::BTreeSet::new();
    while paths.len() < count {
        let depth = (0..3).fake::<usize>();
        let mut parts = (0..depth).map(|_| Word().fake::<String>()).collect::<Vec<_>>();
        parts.push(format!("{}.txt", Word().fake::<String>()));
        paths.insert(parts.join("/"));
    }
    paths.into_iter().collect()
}

/// Parses `<token>: <path>` lines
pub fn parse_entries(stdout: &[u8]) -> Vec<(u32, String)> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| {
            let (token, path) = line.split_once(": ")?;
            Some((token.parse().ok()?, path.to_string()))
        })
        .collect()
}
