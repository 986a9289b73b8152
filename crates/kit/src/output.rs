//! Parsing of VBoxManage's blank-line-separated `Key: Value` listing output.
//!
//! The `list` subcommands print loosely aligned columnar text whose padding
//! and field set drift between VirtualBox releases. Treating each record as
//! an independent chunk of key/value lines, instead of fixed-column parsing,
//! keeps one parser working across those format variants.

/// An ordered set of key/value pairs parsed from one blank-line-delimited
/// chunk of listing output.
///
/// Keys keep their original spelling minus the trailing colon; values may be
/// empty (VirtualBox prints bare `IPV6Address:` lines for unset fields).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBlock {
    pairs: Vec<(String, String)>,
}

impl RawBlock {
    /// First value recorded for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn insert(&mut self, key: String, value: String) {
        self.pairs.push((key, value));
    }
}

/// Split `text` into key/value blocks, keeping only blocks that carry every
/// key in `required_keys`.
///
/// Blocks are separated by one or more blank lines. Within a block each line
/// is split on its first `:` with both sides trimmed; lines without a `:`
/// are ignored. Incomplete blocks are dropped from the result (partial or
/// transient tool output must not abort an otherwise-successful listing),
/// with a debug diagnostic naming the missing key. Empty or whitespace-only
/// input yields an empty vec.
pub fn parse_blocks(text: &str, required_keys: &[&str]) -> Vec<RawBlock> {
    let mut blocks = Vec::new();
    let mut current = RawBlock::default();

    for line in text.lines() {
        if line.trim().is_empty() {
            push_complete(&mut blocks, std::mem::take(&mut current), required_keys);
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        current.insert(key.trim().to_string(), value.trim().to_string());
    }
    push_complete(&mut blocks, current, required_keys);

    blocks
}

fn push_complete(blocks: &mut Vec<RawBlock>, block: RawBlock, required_keys: &[&str]) {
    if block.pairs.is_empty() {
        return;
    }
    if let Some(missing) = required_keys.iter().find(|key| block.get(key).is_none()) {
        tracing::debug!("dropping output block missing required key '{missing}'");
        return;
    }
    blocks.push(block);
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Name:            vboxnet0
IPAddress:       172.28.128.1
Status:          Up

Name:            vboxnet1
IPAddress:       10.0.0.1
Status:          Up
";

    #[test]
    fn blocks_come_back_in_input_order() {
        let blocks = parse_blocks(LISTING, &["Name"]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].get("Name"), Some("vboxnet0"));
        assert_eq!(blocks[1].get("Name"), Some("vboxnet1"));
    }

    #[test]
    fn padding_differences_do_not_matter() {
        let tight = "Name: vboxnet0\nStatus: Up\n";
        let padded = "Name:                vboxnet0\nStatus:      Up\n";
        assert_eq!(parse_blocks(tight, &[]), parse_blocks(padded, &[]));
    }

    #[test]
    fn empty_input_yields_no_blocks() {
        assert!(parse_blocks("", &["Name"]).is_empty());
        assert!(parse_blocks("\n\n  \n", &["Name"]).is_empty());
    }

    #[test]
    fn blocks_missing_required_keys_are_dropped() {
        let text = "Name: vboxnet0\n\nStatus: Up\n";
        let blocks = parse_blocks(text, &["Name"]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].get("Name"), Some("vboxnet0"));
    }

    #[test]
    fn lines_without_a_colon_are_ignored() {
        let text = "Oracle VM VirtualBox\nName: vboxnet0\n";
        let blocks = parse_blocks(text, &[]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].get("Name"), Some("vboxnet0"));
    }

    #[test]
    fn values_keep_embedded_colons() {
        let text = "HardwareAddress: 0a:00:27:00:00:00\n";
        let blocks = parse_blocks(text, &[]);
        assert_eq!(blocks[0].get("HardwareAddress"), Some("0a:00:27:00:00:00"));
    }

    #[test]
    fn missing_values_parse_as_empty() {
        let text = "IPV6Address:\nName: vboxnet0\n";
        let blocks = parse_blocks(text, &[]);
        assert_eq!(blocks[0].get("IPV6Address"), Some(""));
    }

    #[test]
    fn reparsing_is_stable() {
        assert_eq!(parse_blocks(LISTING, &["Name"]), parse_blocks(LISTING, &["Name"]));
    }
}
