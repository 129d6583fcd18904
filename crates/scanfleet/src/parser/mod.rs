//! Tool output parsers. Each one turns a tool's native output into typed
//! records; storage is the normalizer's job.

mod json;
mod nmap;

use thiserror::Error;

pub use json::{
    parse_afrog_json, parse_dddd_json, parse_dirsearch_json, parse_fscan_jsonl,
    parse_nuclei_jsonl,
};
pub use nmap::parse_nmap_xml;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid XML: {0}")]
    Xml(#[from] quick_xml::de::DeError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
