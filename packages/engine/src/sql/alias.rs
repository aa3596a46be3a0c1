/// Hands out `{name}_{n}` aliases from one counter per compilation, so aliases stay unique
/// across the root query and every nested-many template it spawns.
#[derive(Debug, Default)]
pub(crate) struct AliasGenerator {
    next: usize,
}

impl AliasGenerator {
    pub(crate) fn next(&mut self, name: &str) -> String {
        let alias = format!("{}_{}", sanitize(name), self.next);
        self.next += 1;
        alias
    }
}

// The trailing `_{n}` decides uniqueness; the readable part only needs to be identifier-safe.
fn sanitize(name: &str) -> String {
    let cleaned = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>();
    if cleaned.is_empty() {
        "col".to_string()
    } else {
        cleaned
    }
}
