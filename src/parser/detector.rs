use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How much of the artifact the detector looks at.
const SAMPLE_BYTES: usize = 128 * 1024;
/// Below this best score the artifact is unclassifiable.
const MIN_SCORE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentFormat {
    Xbrl,
    Ixbrl,
    Html,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub format: DocumentFormat,
    pub confidence: f64,
}

/// Classifies raw bytes by scoring each candidate format independently
/// and taking the argmax; ties break iXBRL > XBRL > HTML. Never fails on
/// ambiguous input.
pub fn detect(content: &[u8], path_hint: Option<&Path>) -> Detection {
    let sample_len = content.len().min(SAMPLE_BYTES);
    let sample = String::from_utf8_lossy(&content[..sample_len]);
    if sample.trim().is_empty() {
        return Detection {
            format: DocumentFormat::Unknown,
            confidence: 1.0,
        };
    }

    let lower = sample.to_lowercase();
    let root = root_element_name(&sample);
    let root_local = root
        .as_deref()
        .map(|name| name.rsplit(':').next().unwrap_or(name).to_lowercase());

    let html_root = root_local.as_deref() == Some("html") || lower.contains("<!doctype html");
    let xbrl_root = root_local.as_deref() == Some("xbrl");
    let instance_ns = lower.contains("http://www.xbrl.org/2003/instance");
    let ix_marker = lower.contains("xmlns:ix=")
        || lower.contains("http://www.xbrl.org/2013/inlinexbrl")
        || lower.contains("<ix:");
    let embedded_xbrl = html_root && (lower.contains("<xbrl") || lower.contains(":xbrl"));

    let mut xbrl_score: f64 = 0.0;
    if xbrl_root {
        xbrl_score += 0.6;
    }
    if instance_ns && !html_root {
        xbrl_score += 0.3;
    }
    if !html_root && (xbrl_root || instance_ns) {
        xbrl_score += 0.1;
    }

    let mut ixbrl_score: f64 = 0.0;
    if html_root {
        ixbrl_score += 0.4;
    }
    if ix_marker {
        ixbrl_score += 0.4;
    }
    if embedded_xbrl {
        ixbrl_score += 0.2;
    }

    let mut html_score: f64 = 0.0;
    if html_root {
        html_score += 0.6;
    }
    if lower.contains("<table") {
        html_score += 0.2;
    }
    if html_root && !ix_marker && !embedded_xbrl {
        html_score += 0.2;
    }

    // File extension is a weak auxiliary signal only.
    if let Some(ext) = path_hint.and_then(|p| p.extension()).and_then(|e| e.to_str()) {
        match ext.to_lowercase().as_str() {
            "xbrl" | "xml" => xbrl_score += 0.1,
            "html" | "htm" => html_score += 0.1,
            _ => {}
        }
    }

    // Argmax with the fixed tie order.
    let candidates = [
        (DocumentFormat::Ixbrl, ixbrl_score),
        (DocumentFormat::Xbrl, xbrl_score),
        (DocumentFormat::Html, html_score),
    ];
    let (format, score) = candidates
        .iter()
        .copied()
        .fold((DocumentFormat::Unknown, 0.0_f64), |best, cand| {
            if cand.1 > best.1 {
                cand
            } else {
                best
            }
        });

    if score < MIN_SCORE {
        Detection {
            format: DocumentFormat::Unknown,
            confidence: 1.0 - score,
        }
    } else {
        Detection {
            format,
            confidence: score.min(1.0),
        }
    }
}

/// First start element of the sample, prefix included. Parse errors just
/// end the scan; the sample is routinely a truncated document.
fn root_element_name(sample: &str) -> Option<String> {
    let mut reader = Reader::from_str(sample);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return std::str::from_utf8(e.name().as_ref())
                    .ok()
                    .map(|s| s.to_string());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XBRL_DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xbrli:xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance">
  <xbrli:context id="c1"/>
</xbrli:xbrl>"#;

    const IXBRL_DOC: &str = r#"<!DOCTYPE html>
<html xmlns:ix="http://www.xbrl.org/2013/inlineXBRL">
<body><div style="display:none"><xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance"></xbrl></div></body>
</html>"#;

    const HTML_DOC: &str = r#"<!DOCTYPE html>
<html><head><title>基金2024年年度报告</title></head>
<body><table><tr><td>基金代码</td><td>000001</td></tr></table></body></html>"#;

    #[test]
    fn labeled_corpus_is_stable() {
        assert_eq!(detect(XBRL_DOC.as_bytes(), None).format, DocumentFormat::Xbrl);
        assert_eq!(detect(IXBRL_DOC.as_bytes(), None).format, DocumentFormat::Ixbrl);
        assert_eq!(detect(HTML_DOC.as_bytes(), None).format, DocumentFormat::Html);
    }

    #[test]
    fn ixbrl_beats_plain_html_on_ties() {
        let detection = detect(IXBRL_DOC.as_bytes(), None);
        assert_eq!(detection.format, DocumentFormat::Ixbrl);
        assert!(detection.confidence >= 0.8);
    }

    #[test]
    fn garbage_is_unknown_without_panicking() {
        let detection = detect(b"\x00\x01\x02 not markup at all", None);
        assert_eq!(detection.format, DocumentFormat::Unknown);
    }

    #[test]
    fn empty_is_unknown() {
        assert_eq!(detect(b"", None).format, DocumentFormat::Unknown);
    }

    #[test]
    fn extension_hint_nudges_ambiguous_xml() {
        let bare = r#"<?xml version="1.0"?><data><row/></data>"#;
        let detection = detect(bare.as_bytes(), Some(Path::new("report.xbrl")));
        // A lone extension hint is not enough to classify.
        assert_eq!(detection.format, DocumentFormat::Unknown);
    }
}
