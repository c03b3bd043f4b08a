//! Typed model of the ini-like interface definition file.
//!
//! The file is parsed into sections of lines, edited in place, and written
//! back. Comments, blank lines, key order and unknown keys survive a round
//! trip; only the lines that are deliberately edited change.

use std::fmt;

use super::error::{TunnelError, TunnelResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Entry { key: String, value: String },
    /// Comment kept verbatim, including its marker
    Comment(String),
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Interface,
    Peer,
}

impl SectionKind {
    fn header(&self) -> &'static str {
        match self {
            SectionKind::Interface => "[Interface]",
            SectionKind::Peer => "[Peer]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub lines: Vec<Line>,
}

impl Section {
    pub fn new(kind: SectionKind) -> Self {
        Section {
            kind,
            lines: Vec::new(),
        }
    }

    /// First value for `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, value } if k.eq_ignore_ascii_case(key) => Some(value.as_str()),
            _ => None,
        })
    }

    /// Replace the first value for `key`, or add it after the last entry.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        for line in &mut self.lines {
            if let Line::Entry { key: k, value: v } = line {
                if k.eq_ignore_ascii_case(key) {
                    *v = value;
                    return;
                }
            }
        }

        let at = self
            .lines
            .iter()
            .rposition(|line| !matches!(line, Line::Blank))
            .map_or(0, |idx| idx + 1);
        self.lines.insert(
            at,
            Line::Entry {
                key: key.to_string(),
                value,
            },
        );
    }

    pub fn push_entry(&mut self, key: &str, value: impl Into<String>) {
        self.lines.push(Line::Entry {
            key: key.to_string(),
            value: value.into(),
        });
    }

    pub fn public_key(&self) -> Option<&str> {
        self.get("PublicKey")
    }

    /// Comma-separated `AllowedIPs` split into trimmed items.
    pub fn allowed_ips(&self) -> Vec<&str> {
        self.get("AllowedIPs")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ends_with_blank(&self) -> bool {
        matches!(self.lines.last(), Some(Line::Blank))
    }
}

/// Parsed interface definition: one `[Interface]` and any number of `[Peer]`s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDefinition {
    /// Comments and blank lines before the first section
    pub preamble: Vec<Line>,
    pub sections: Vec<Section>,
}

impl InterfaceDefinition {
    pub fn parse(text: &str) -> TunnelResult<Self> {
        let mut definition = InterfaceDefinition::default();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw.trim();

            if trimmed.is_empty() {
                definition.push_line(Line::Blank);
                continue;
            }

            if trimmed.starts_with('#') || trimmed.starts_with(';') {
                definition.push_line(Line::Comment(trimmed.to_string()));
                continue;
            }

            if trimmed.starts_with('[') {
                let name = trimmed
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .ok_or_else(|| TunnelError::ConfigCorruption {
                        line: line_no,
                        message: format!("malformed section header {trimmed}"),
                    })?;
                let kind = match name.trim().to_ascii_lowercase().as_str() {
                    "interface" => SectionKind::Interface,
                    "peer" => SectionKind::Peer,
                    other => {
                        return Err(TunnelError::ConfigCorruption {
                            line: line_no,
                            message: format!("unknown section {other}"),
                        })
                    }
                };
                definition.sections.push(Section::new(kind));
                continue;
            }

            let (key, value) = trimmed.split_once('=').ok_or_else(|| {
                TunnelError::ConfigCorruption {
                    line: line_no,
                    message: "expected `Key = Value`".to_string(),
                }
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(TunnelError::ConfigCorruption {
                    line: line_no,
                    message: "entry without a key".to_string(),
                });
            }

            match definition.sections.last_mut() {
                Some(section) => section.push_entry(key, value.trim()),
                None => {
                    return Err(TunnelError::ConfigCorruption {
                        line: line_no,
                        message: format!("{key} appears before any section"),
                    })
                }
            }
        }

        let interfaces = definition
            .sections
            .iter()
            .filter(|section| section.kind == SectionKind::Interface)
            .count();
        if interfaces > 1 {
            return Err(TunnelError::ConfigCorruption {
                line: 0,
                message: "more than one [Interface] section".to_string(),
            });
        }

        Ok(definition)
    }

    fn push_line(&mut self, line: Line) {
        match self.sections.last_mut() {
            Some(section) => section.lines.push(line),
            None => self.preamble.push(line),
        }
    }

    pub fn interface(&self) -> Option<&Section> {
        self.sections
            .iter()
            .find(|section| section.kind == SectionKind::Interface)
    }

    pub fn interface_mut(&mut self) -> Option<&mut Section> {
        self.sections
            .iter_mut()
            .find(|section| section.kind == SectionKind::Interface)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Section> {
        self.sections
            .iter()
            .filter(|section| section.kind == SectionKind::Peer)
    }

    pub fn find_peer(&self, public_key: &str) -> Option<&Section> {
        self.peers()
            .find(|peer| peer.public_key() == Some(public_key))
    }

    /// Append a section, keeping one blank line between stanzas.
    pub fn push_section(&mut self, section: Section) {
        if let Some(last) = self.sections.last_mut() {
            if !last.ends_with_blank() {
                last.lines.push(Line::Blank);
            }
        }
        self.sections.push(section);
    }

    /// Make sure exactly one peer entry for `public_key` routes `allowed_ips`.
    ///
    /// Returns false when the file already had that entry.
    pub fn upsert_peer(&mut self, public_key: &str, allowed_ips: &str, label: Option<&str>) -> bool {
        let mut matching = self
            .sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == SectionKind::Peer && s.public_key() == Some(public_key))
            .map(|(idx, _)| idx);

        if let Some(first) = matching.next() {
            let duplicates: Vec<usize> = matching.collect();
            let mut changed = !duplicates.is_empty();
            for idx in duplicates.into_iter().rev() {
                self.sections.remove(idx);
            }

            let section = &mut self.sections[first];
            if section.get("AllowedIPs") != Some(allowed_ips) {
                section.set("AllowedIPs", allowed_ips);
                changed = true;
            }
            return changed;
        }

        let mut section = Section::new(SectionKind::Peer);
        if let Some(label) = label {
            section.lines.push(Line::Comment(format!("# {label}")));
        }
        section.push_entry("PublicKey", public_key);
        section.push_entry("AllowedIPs", allowed_ips);
        self.push_section(section);
        true
    }

    /// Remove every peer stanza for `public_key`; returns whether any existed.
    pub fn remove_peer(&mut self, public_key: &str) -> bool {
        let before = self.sections.len();
        self.sections
            .retain(|s| !(s.kind == SectionKind::Peer && s.public_key() == Some(public_key)));
        before != self.sections.len()
    }

    /// Remove peers other than `keep` that route `allowed_ip`; returns their keys.
    pub fn remove_conflicting_peers(&mut self, allowed_ip: &str, keep: &str) -> Vec<String> {
        let conflicting: Vec<String> = self
            .peers()
            .filter(|peer| peer.public_key() != Some(keep))
            .filter(|peer| peer.allowed_ips().contains(&allowed_ip))
            .filter_map(|peer| peer.public_key().map(str::to_string))
            .collect();

        for key in &conflicting {
            self.remove_peer(key);
        }
        conflicting
    }

    pub fn interface_address(&self) -> Option<&str> {
        self.interface().and_then(|section| section.get("Address"))
    }

    /// Set `Address` on the interface section. Returns false if there is none.
    pub fn set_interface_address(&mut self, address: &str) -> bool {
        match self.interface_mut() {
            Some(section) => {
                section.set("Address", address);
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for InterfaceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_line(f: &mut fmt::Formatter<'_>, line: &Line) -> fmt::Result {
            match line {
                Line::Entry { key, value } => writeln!(f, "{key} = {value}"),
                Line::Comment(text) => writeln!(f, "{text}"),
                Line::Blank => writeln!(f),
            }
        }

        for line in &self.preamble {
            write_line(f, line)?;
        }
        for section in &self.sections {
            writeln!(f, "{}", section.kind.header())?;
            for line in &section.lines {
                write_line(f, line)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# managed by peerwarden
[Interface]
Address = 10.100.0.1/16
ListenPort = 51820
PrivateKey = c2VydmVyLXByaXZhdGU=
PostUp = iptables -A FORWARD -i %i -j ACCEPT

[Peer]
# worker-1
PublicKey = AAA=
AllowedIPs = 10.100.1.1/32

[Peer]
PublicKey = BBB=
AllowedIPs = 10.100.1.2/32, 192.168.5.0/24
";

    #[test]
    fn round_trip_is_lossless() {
        let parsed = InterfaceDefinition::parse(SAMPLE).unwrap();
        assert_eq!(parsed.to_string(), SAMPLE);
        assert_eq!(parsed.peers().count(), 2);
        assert_eq!(parsed.interface_address(), Some("10.100.0.1/16"));
        assert_eq!(
            parsed.interface().unwrap().get("postup"),
            Some("iptables -A FORWARD -i %i -j ACCEPT")
        );
        assert_eq!(
            parsed.find_peer("BBB=").unwrap().allowed_ips(),
            vec!["10.100.1.2/32", "192.168.5.0/24"]
        );
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut def = InterfaceDefinition::parse(SAMPLE).unwrap();

        assert!(def.upsert_peer("CCC=", "10.100.1.3/32", Some("worker-3")));
        let once = def.to_string();
        assert!(!def.upsert_peer("CCC=", "10.100.1.3/32", Some("worker-3")));
        assert_eq!(def.to_string(), once);
        assert!(once.ends_with("[Peer]\n# worker-3\nPublicKey = CCC=\nAllowedIPs = 10.100.1.3/32\n"));
        assert!(once.contains("AllowedIPs = 10.100.1.2/32, 192.168.5.0/24\n\n[Peer]\n# worker-3"));

        assert!(def.upsert_peer("CCC=", "10.100.1.9/32", None));
        assert_eq!(def.find_peer("CCC=").unwrap().get("AllowedIPs"), Some("10.100.1.9/32"));
        assert_eq!(def.peers().count(), 3);
    }

    #[test]
    fn upsert_collapses_duplicates() {
        let text = "[Interface]\nAddress = 10.0.0.1/16\n\n[Peer]\nPublicKey = AAA=\nAllowedIPs = 10.0.1.2/32\n\n[Peer]\nPublicKey = AAA=\nAllowedIPs = 10.0.1.2/32\n";
        let mut def = InterfaceDefinition::parse(text).unwrap();
        assert!(def.upsert_peer("AAA=", "10.0.1.2/32", None));
        assert_eq!(def.peers().count(), 1);
    }

    #[test]
    fn remove_peer_is_surgical() {
        let mut def = InterfaceDefinition::parse(SAMPLE).unwrap();

        assert!(def.remove_peer("AAA="));
        assert!(!def.remove_peer("AAA="));
        let text = def.to_string();
        assert!(!text.contains("worker-1"));
        assert!(text.contains("PostUp = iptables"));
        assert!(text.contains("PublicKey = BBB="));
    }

    #[test]
    fn conflicting_peers_are_removed() {
        let mut def = InterfaceDefinition::parse(SAMPLE).unwrap();

        let removed = def.remove_conflicting_peers("10.100.1.2/32", "NEW=");
        assert_eq!(removed, vec!["BBB=".to_string()]);
        assert!(def.remove_conflicting_peers("10.100.1.1/32", "AAA=").is_empty());
        assert!(def.find_peer("AAA=").is_some());
    }

    #[test]
    fn interface_address_can_be_replaced() {
        let mut def = InterfaceDefinition::parse(SAMPLE).unwrap();
        assert!(def.set_interface_address("10.100.0.1/24"));
        assert_eq!(def.interface_address(), Some("10.100.0.1/24"));
        assert!(def.to_string().contains("[Interface]\nAddress = 10.100.0.1/24\nListenPort"));

        let mut bare = InterfaceDefinition::default();
        assert!(!bare.set_interface_address("10.100.0.1/16"));
    }

    #[test]
    fn corrupt_input_is_reported() {
        for (text, line) in [
            ("[Interface\nAddress = 1\n", 1),
            ("[Interface]\nAddress 10.0.0.1\n", 2),
            ("Address = 10.0.0.1\n", 1),
            ("[Interface]\n[Tunnel]\n", 2),
        ] {
            match InterfaceDefinition::parse(text) {
                Err(TunnelError::ConfigCorruption { line: l, .. }) => assert_eq!(l, line, "{text}"),
                other => panic!("expected corruption for {text:?}, got {other:?}"),
            }
        }

        assert!(InterfaceDefinition::parse("[Interface]\n[Interface]\n").is_err());
    }
}
