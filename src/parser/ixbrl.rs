use log::{debug, warn};
use scraper::{ElementRef, Html, Selector};

/// Pulls the embedded XBRL instance out of an iXBRL container: the first
/// element whose local name is `xbrl` under `<body>`, falling back to
/// anywhere in the document, re-serialized as a standalone UTF-8 XML
/// document. Returns None when the container holds no instance.
///
/// Authoring tools routinely hoist the namespace declarations onto the
/// `<html>` element, so any `xmlns:*` attributes visible on ancestors are
/// re-injected onto the serialized root; without them the output would
/// not stand alone as XML.
pub fn extract(content: &[u8]) -> Option<Vec<u8>> {
    let text = String::from_utf8_lossy(content);
    let document = Html::parse_document(&text);

    let body_selector = Selector::parse("body").expect("static selector");
    let xbrl = document
        .select(&body_selector)
        .next()
        .and_then(find_xbrl)
        .or_else(|| find_xbrl(document.root_element()));

    let xbrl = match xbrl {
        Some(el) => el,
        None => {
            warn!("no embedded xbrl element found in iXBRL container");
            return None;
        }
    };

    let inherited = inherited_namespaces(xbrl);
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    serialize(xbrl, &inherited, &mut out);
    debug!(
        "extracted embedded xbrl subtree ({} bytes, {} inherited namespaces)",
        out.len(),
        inherited.len()
    );
    Some(out.into_bytes())
}

fn find_xbrl(scope: ElementRef) -> Option<ElementRef> {
    for node in scope.descendants() {
        if let Some(el) = ElementRef::wrap(node) {
            let name = el.value().name();
            if name == "xbrl" || name.ends_with(":xbrl") {
                return Some(el);
            }
        }
    }
    None
}

/// xmlns declarations present on ancestors but missing from the element
/// itself.
fn inherited_namespaces(el: ElementRef) -> Vec<(String, String)> {
    let own: Vec<String> = el
        .value()
        .attrs()
        .filter(|(k, _)| k.starts_with("xmlns"))
        .map(|(k, _)| k.to_string())
        .collect();

    let mut found: Vec<(String, String)> = Vec::new();
    for ancestor in el.ancestors() {
        if let Some(ael) = ElementRef::wrap(ancestor) {
            for (k, v) in ael.value().attrs() {
                if k.starts_with("xmlns")
                    && !own.iter().any(|o| o == k)
                    && !found.iter().any(|(f, _)| f == k)
                {
                    found.push((k.to_string(), v.to_string()));
                }
            }
        }
    }
    found
}

fn serialize(el: ElementRef, extra_attrs: &[(String, String)], out: &mut String) {
    let name = el.value().name();
    out.push('<');
    out.push_str(name);
    for (k, v) in el.value().attrs() {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape(v));
        out.push('"');
    }
    for (k, v) in extra_attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape(v));
        out.push('"');
    }
    out.push('>');

    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            serialize(child_el, &[], out);
        } else if let scraper::Node::Text(text) = child.value() {
            out.push_str(&escape(text));
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_subtree_under_body() {
        let html = r#"<html xmlns:xbrli="http://www.xbrl.org/2003/instance" xmlns:cn="http://csrc.example/cn">
<body>
<div><xbrl><cn:fundcode contextref="c1">000001</cn:fundcode></xbrl></div>
</body></html>"#;
        let xml = extract(html.as_bytes()).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.starts_with("<?xml"));
        assert!(text.contains("<xbrl"));
        // Ancestor namespace declarations travel with the subtree.
        assert!(text.contains("xmlns:xbrli=\"http://www.xbrl.org/2003/instance\""));
        assert!(text.contains("xmlns:cn=\"http://csrc.example/cn\""));
        assert!(text.contains("000001"));
    }

    #[test]
    fn falls_back_to_xbrl_outside_body() {
        let html = r#"<html><head><xbrli:xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance"></xbrli:xbrl></head><body></body></html>"#;
        // html5ever relocates unknown head content into body, but either
        // way the fallback scan must find the element.
        assert!(extract(html.as_bytes()).is_some());
    }

    #[test]
    fn none_when_no_instance_embedded() {
        let html = "<html><body><p>纯HTML报告</p></body></html>";
        assert!(extract(html.as_bytes()).is_none());
    }

    #[test]
    fn output_is_parseable_xml() {
        let html = r#"<html xmlns:xbrli="http://www.xbrl.org/2003/instance">
<body><xbrl><xbrli:context id="c1"><xbrli:entity><xbrli:identifier scheme="s">华夏 &amp; 基金</xbrli:identifier></xbrli:entity></xbrli:context></xbrl></body></html>"#;
        let xml = extract(html.as_bytes()).unwrap();
        let text = String::from_utf8(xml).unwrap();
        let doc = roxmltree::Document::parse(&text).unwrap();
        let identifier = doc
            .descendants()
            .find(|n| n.tag_name().name() == "identifier")
            .unwrap();
        assert_eq!(identifier.text(), Some("华夏 & 基金"));
    }
}
