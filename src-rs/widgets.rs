use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// One view-hierarchy node that declares `bounds`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WidgetRecord {
    #[serde(rename = "class")]
    pub class_name: String,
    pub text: String,
    #[serde(rename = "resource-id")]
    pub resource_id: String,
    pub clickable: bool,
    /// Raw `[x1,y1][x2,y2]` string; parsed by the annotator.
    pub bounds: String,
}

impl WidgetRecord {
    pub fn is_notable(&self) -> bool {
        self.clickable || !self.text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bounds {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// Parse Android-style `[x1,y1][x2,y2]` bounds. The error is a skip reason.
pub fn parse_bounds(raw: &str) -> Result<Bounds, String> {
    let flattened = raw.trim().replace("][", ",");
    let body = flattened.trim_matches(|c| c == '[' || c == ']');
    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(format!(
            "expected 4 coordinates in bounds {raw:?}, got {}",
            parts.len()
        ));
    }
    let mut coords = [0i32; 4];
    for (slot, part) in coords.iter_mut().zip(&parts) {
        *slot = part
            .parse::<i32>()
            .map_err(|_| format!("invalid coordinate {part:?} in bounds {raw:?}"))?;
    }
    Ok(Bounds {
        x1: coords[0],
        y1: coords[1],
        x2: coords[2],
        y2: coords[3],
    })
}

/// Every element carrying `bounds`, in document order. Unparseable XML yields
/// an empty list.
pub fn extract_widgets(xml: &str) -> Vec<WidgetRecord> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..roxmltree::ParsingOptions::default()
    };
    let doc = match roxmltree::Document::parse_with_options(xml, options) {
        Ok(doc) => doc,
        Err(err) => {
            warn!("could not parse view hierarchy XML: {err}");
            return Vec::new();
        }
    };

    let widgets: Vec<WidgetRecord> = doc
        .descendants()
        .filter(|node| node.is_element())
        .filter_map(|node| {
            let bounds = node.attribute("bounds")?;
            Some(WidgetRecord {
                class_name: node.attribute("class").unwrap_or("N/A").to_string(),
                text: node.attribute("text").unwrap_or_default().to_string(),
                resource_id: node.attribute("resource-id").unwrap_or_default().to_string(),
                clickable: node.attribute("clickable").unwrap_or("false") == "true",
                bounds: bounds.to_string(),
            })
        })
        .collect();

    debug!(count = widgets.len(), "extracted widgets from view hierarchy");
    widgets
}

/// Read and extract a view hierarchy file. Missing or unreadable files degrade
/// to an empty widget list.
pub fn load_widgets(path: &Path) -> Vec<WidgetRecord> {
    if !path.exists() {
        warn!("XML file not found at {}", path.display());
        return Vec::new();
    }
    match fs::read_to_string(path) {
        Ok(raw) => extract_widgets(&raw),
        Err(err) => {
            warn!("could not read XML file at {}: {err}", path.display());
            Vec::new()
        }
    }
}
