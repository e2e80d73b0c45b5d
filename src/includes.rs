//! Client bootstrap tag
//!
//! When auto-inject is on, HTML page responses get a `<script>` tag whose
//! `data-*` attributes tell the correlation client where the profiler lives
//! and which profile belongs to the page itself. The client reads the same
//! attributes back with [`BootstrapOptions::from_attributes`].

use thiserror::Error;

use crate::config::{Position, ProfilerConfig};
use crate::profile::ProfileId;

/// Element id of the injected script tag
pub const SCRIPT_ID: &str = "mini-profiler";

/// Client asset served under the base path
pub const CLIENT_SCRIPT: &str = "includes.js";

/// Errors reading bootstrap attributes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IncludesError {
    #[error("Missing required attribute {0}")]
    MissingAttribute(&'static str),
}

/// Options carried by the bootstrap tag
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapOptions {
    pub version: String,
    pub path: String,
    pub current_id: ProfileId,
    pub ids: Vec<ProfileId>,
    pub position: Position,
    pub show_trivial: bool,
    pub show_children: bool,
    pub show_controls: bool,
    pub authorized: bool,
    pub max_traces_to_show: u32,
    pub start_hidden: bool,
    pub collapse_results: bool,
    pub toggle_shortcut: Option<String>,
}

impl BootstrapOptions {
    pub fn new(config: &ProfilerConfig, current_id: ProfileId) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            path: config.base_url_path.clone(),
            ids: vec![current_id.clone()],
            current_id,
            position: config.position,
            show_trivial: config.show_trivial,
            show_children: config.show_children,
            show_controls: config.show_controls,
            authorized: true,
            max_traces_to_show: config.max_traces_to_show,
            start_hidden: config.start_hidden,
            collapse_results: config.collapse_results,
            toggle_shortcut: config.toggle_shortcut.clone(),
        }
    }

    /// Render the `<script>` tag appended to HTML pages
    pub fn to_script_tag(&self) -> String {
        let ids = self
            .ids
            .iter()
            .map(ProfileId::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let mut attrs = vec![
            ("id", SCRIPT_ID.to_string()),
            (
                "src",
                format!("{}{}?v={}", self.path, CLIENT_SCRIPT, self.version),
            ),
            ("data-version", self.version.clone()),
            ("data-path", self.path.clone()),
            ("data-current-id", self.current_id.to_string()),
            ("data-ids", ids),
            ("data-horizontal-position", self.position.as_str().to_string()),
            ("data-trivial", self.show_trivial.to_string()),
            ("data-children", self.show_children.to_string()),
            ("data-controls", self.show_controls.to_string()),
            ("data-authorized", self.authorized.to_string()),
            ("data-max-traces", self.max_traces_to_show.to_string()),
            ("data-start-hidden", self.start_hidden.to_string()),
            ("data-collapse-results", self.collapse_results.to_string()),
        ];
        if let Some(shortcut) = &self.toggle_shortcut {
            attrs.push(("data-toggle-shortcut", shortcut.clone()));
        }

        let rendered: Vec<String> = attrs
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_attr(v)))
            .collect();
        format!("<script async {}></script>", rendered.join(" "))
    }

    /// Rebuild options from decoded attribute name/value pairs.
    ///
    /// `data-path` and `data-current-id` are required; boolean attributes
    /// are true only when literally `"true"`.
    pub fn from_attributes<'a, I>(attrs: I) -> Result<Self, IncludesError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut path = None;
        let mut current_id = None;
        let mut options = Self {
            version: String::new(),
            path: String::new(),
            current_id: ProfileId::new(""),
            ids: Vec::new(),
            position: Position::Left,
            show_trivial: false,
            show_children: false,
            show_controls: false,
            authorized: false,
            max_traces_to_show: 15,
            start_hidden: false,
            collapse_results: false,
            toggle_shortcut: None,
        };

        for (name, value) in attrs {
            let flag = value == "true";
            match name {
                "data-version" => options.version = value.to_string(),
                "data-path" => path = Some(value.to_string()),
                "data-current-id" => current_id = Some(ProfileId::new(value)),
                "data-ids" => {
                    options.ids = value
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(ProfileId::new)
                        .collect()
                }
                "data-horizontal-position" => {
                    options.position = if value == "right" {
                        Position::Right
                    } else {
                        Position::Left
                    }
                }
                "data-trivial" => options.show_trivial = flag,
                "data-children" => options.show_children = flag,
                "data-controls" => options.show_controls = flag,
                "data-authorized" => options.authorized = flag,
                "data-max-traces" => {
                    if let Ok(n) = value.parse() {
                        options.max_traces_to_show = n;
                    }
                }
                "data-start-hidden" => options.start_hidden = flag,
                "data-collapse-results" => options.collapse_results = flag,
                "data-toggle-shortcut" => options.toggle_shortcut = Some(value.to_string()),
                _ => {}
            }
        }

        options.path = path.ok_or(IncludesError::MissingAttribute("data-path"))?;
        options.current_id = current_id
            .filter(|id| !id.as_str().is_empty())
            .ok_or(IncludesError::MissingAttribute("data-current-id"))?;
        Ok(options)
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_tag_carries_ids_and_path() {
        let config = ProfilerConfig::default();
        let tag = BootstrapOptions::new(&config, ProfileId::new("abc123")).to_script_tag();
        assert!(tag.starts_with("<script async id=\"mini-profiler\""));
        assert!(tag.contains("data-path=\"/mini-profiler-resources/\""));
        assert!(tag.contains("data-current-id=\"abc123\""));
        assert!(tag.contains("data-ids=\"abc123\""));
        assert!(tag.contains("src=\"/mini-profiler-resources/includes.js?v="));
        assert!(!tag.contains("data-toggle-shortcut"));
    }

    #[test]
    fn test_attribute_values_are_escaped() {
        let config = ProfilerConfig {
            toggle_shortcut: Some("Alt+\"P\"".to_string()),
            ..Default::default()
        };
        let tag = BootstrapOptions::new(&config, ProfileId::new("a")).to_script_tag();
        assert!(tag.contains("data-toggle-shortcut=\"Alt+&quot;P&quot;\""));
    }

    #[test]
    fn test_from_attributes() {
        let attrs = [
            ("data-path", "/mp/"),
            ("data-current-id", "abc"),
            ("data-ids", "abc,def"),
            ("data-trivial", "true"),
            ("data-controls", "false"),
            ("data-horizontal-position", "right"),
            ("data-max-traces", "7"),
        ];
        let options = BootstrapOptions::from_attributes(attrs).unwrap();
        assert_eq!(options.path, "/mp/");
        assert_eq!(options.current_id, ProfileId::new("abc"));
        assert_eq!(options.ids, vec![ProfileId::new("abc"), ProfileId::new("def")]);
        assert!(options.show_trivial);
        assert!(!options.show_controls);
        assert_eq!(options.position, Position::Right);
        assert_eq!(options.max_traces_to_show, 7);
    }

    #[test]
    fn test_from_attributes_requires_path_and_id() {
        assert_eq!(
            BootstrapOptions::from_attributes([("data-current-id", "abc")]).unwrap_err(),
            IncludesError::MissingAttribute("data-path")
        );
        assert_eq!(
            BootstrapOptions::from_attributes([("data-path", "/mp/")]).unwrap_err(),
            IncludesError::MissingAttribute("data-current-id")
        );
    }
}
