use chrono::NaiveDate;
use log::debug;
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ParseError;

/// One tagged value from an XBRL instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Qualified concept, `prefix:LocalName` (or the ix `name` attribute
    /// verbatim). Matching downstream is case-insensitive because
    /// instances rehydrated from HTML arrive lowercased.
    pub concept: String,
    pub value_raw: String,
    pub context_ref: String,
    pub unit_ref: Option<String>,
    pub decimals: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Period {
    Instant { at: NaiveDate },
    Duration { start: NaiveDate, end: NaiveDate },
    Unspecified,
}

impl Period {
    /// The reporting-period end this period implies, if any.
    pub fn end_date(&self) -> Option<NaiveDate> {
        match self {
            Period::Instant { at } => Some(*at),
            Period::Duration { end, .. } => Some(*end),
            Period::Unspecified => None,
        }
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        match self {
            Period::Duration { start, .. } => Some(*start),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub entity_identifier: Option<String>,
    pub period: Period,
    /// axis -> member, from explicit members under scenario/segment.
    pub dimensions: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XbrlInstance {
    pub facts: Vec<Fact>,
    pub contexts: HashMap<String, Context>,
    /// unit id -> measure.
    pub units: HashMap<String, String>,
    /// First link:schemaRef xlink:href, for taxonomy version selection.
    pub schema_ref: Option<String>,
}

impl XbrlInstance {
    pub fn context_of<'a>(&'a self, fact: &Fact) -> Option<&'a Context> {
        self.contexts.get(&fact.context_ref)
    }
}

/// Elements that shape the instance but are not facts.
const STRUCTURAL: [&str; 5] = ["xbrl", "context", "unit", "schemaRef", "schemaref"];

/// Parse an XBRL instance into facts, contexts and units. Every element
/// carrying a contextRef is surfaced as a fact; nothing is dropped.
pub fn parse_instance(xml: &str) -> Result<XbrlInstance, ParseError> {
    let doc = Document::parse(xml).map_err(|e| ParseError::Xml(e.to_string()))?;

    let mut instance = XbrlInstance {
        facts: Vec::new(),
        contexts: HashMap::new(),
        units: HashMap::new(),
        schema_ref: None,
    };

    for node in doc.root_element().descendants() {
        if !node.is_element() {
            continue;
        }
        let local = node.tag_name().name();

        match local {
            "context" => {
                if let Some(context) = parse_context(node) {
                    instance.contexts.insert(context.id.clone(), context);
                }
            }
            "unit" => {
                if let (Some(id), Some(measure)) = (node.attribute("id"), first_text(node, "measure"))
                {
                    instance.units.insert(id.to_string(), measure);
                }
            }
            "schemaRef" | "schemaref" => {
                if instance.schema_ref.is_none() {
                    instance.schema_ref = attr_any_ns(node, "href").map(str::to_string);
                }
            }
            _ => {
                if let Some(context_ref) = attr_ci(node, "contextRef") {
                    if STRUCTURAL.contains(&local) {
                        continue;
                    }
                    instance.facts.push(Fact {
                        concept: concept_name(node),
                        value_raw: text_content(node),
                        context_ref: context_ref.to_string(),
                        unit_ref: attr_ci(node, "unitRef").map(str::to_string),
                        decimals: node
                            .attribute("decimals")
                            .and_then(|d| d.parse::<i32>().ok()),
                    });
                }
            }
        }
    }

    debug!(
        "parsed xbrl instance: {} facts, {} contexts, {} units",
        instance.facts.len(),
        instance.contexts.len(),
        instance.units.len()
    );
    Ok(instance)
}

/// Attribute lookup accepting the lowercase variant an HTML round-trip
/// produces (contextRef -> contextref).
fn attr_ci<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    let lower = name.to_lowercase();
    node.attributes()
        .find(|a| a.name() == name || a.name() == lower)
        .map(|a| a.value())
}

/// Attribute by local name regardless of namespace (xlink:href vs href).
fn attr_any_ns<'a>(node: Node<'a, '_>, local: &str) -> Option<&'a str> {
    node.attributes()
        .find(|a| a.name() == local)
        .map(|a| a.value())
}

fn concept_name(node: Node) -> String {
    // Inline facts carry the concept in a name attribute.
    if let Some(name) = node.attribute("name") {
        return name.to_string();
    }
    let local = node.tag_name().name();
    match node
        .tag_name()
        .namespace()
        .and_then(|ns| node.lookup_prefix(ns))
    {
        Some(prefix) if !prefix.is_empty() => format!("{}:{}", prefix, local),
        _ => local.to_string(),
    }
}

fn text_content(node: Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn child_by_local<'a, 'input>(node: Node<'a, 'input>, local: &str) -> Option<Node<'a, 'input>> {
    let lower = local.to_lowercase();
    node.children()
        .find(|c| c.is_element() && (c.tag_name().name() == local || c.tag_name().name() == lower))
}

fn first_text(node: Node, descendant_local: &str) -> Option<String> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == descendant_local)
        .map(text_content)
        .filter(|t| !t.is_empty())
}

fn parse_context(node: Node) -> Option<Context> {
    let id = node.attribute("id")?.to_string();

    let entity_identifier = child_by_local(node, "entity")
        .and_then(|e| first_text(e, "identifier"))
        .filter(|t| !t.is_empty());

    let period = match child_by_local(node, "period") {
        Some(period_node) => parse_period(period_node),
        None => Period::Unspecified,
    };

    let mut dimensions = HashMap::new();
    for scope in ["scenario", "segment"] {
        if let Some(scope_node) = child_by_local(node, scope) {
            for member in scope_node.descendants().filter(|n| {
                n.is_element()
                    && matches!(n.tag_name().name(), "explicitMember" | "explicitmember")
            }) {
                if let (Some(axis), member_value) = (member.attribute("dimension"), text_content(member))
                {
                    if !member_value.is_empty() {
                        dimensions.insert(axis.to_string(), member_value);
                    }
                }
            }
        }
    }

    Some(Context {
        id,
        entity_identifier,
        period,
        dimensions,
    })
}

fn parse_period(node: Node) -> Period {
    if let Some(instant) = child_by_local(node, "instant") {
        if let Some(at) = parse_date(&text_content(instant)) {
            return Period::Instant { at };
        }
        return Period::Unspecified;
    }

    let start = child_by_local(node, "startDate").map(|n| text_content(n));
    let end = child_by_local(node, "endDate").map(|n| text_content(n));
    if let (Some(start), Some(end)) = (start, end) {
        if let (Some(start), Some(end)) = (parse_date(&start), parse_date(&end)) {
            return Period::Duration { start, end };
        }
    }
    Period::Unspecified
}

/// Accepts plain dates and datetime strings by taking the date prefix.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let head: String = raw.trim().chars().take(10).collect();
    NaiveDate::parse_from_str(&head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&head, "%Y/%m/%d"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xbrli:xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance"
            xmlns:link="http://www.xbrl.org/2003/linkbase"
            xmlns:xlink="http://www.w3.org/1999/xlink"
            xmlns:xbrldi="http://xbrl.org/2006/xbrldi"
            xmlns:cn="http://csrc.example/mf">
  <link:schemaRef xlink:type="simple" xlink:href="http://csrc.example/csrc-mf-general-2021.xsd"/>
  <xbrli:context id="AsOf">
    <xbrli:entity><xbrli:identifier scheme="http://csrc.example">000001</xbrli:identifier></xbrli:entity>
    <xbrli:period><xbrli:instant>2024-12-31</xbrli:instant></xbrli:period>
  </xbrli:context>
  <xbrli:context id="FY2024">
    <xbrli:entity><xbrli:identifier scheme="http://csrc.example">000001</xbrli:identifier></xbrli:entity>
    <xbrli:period><xbrli:startDate>2024-01-01</xbrli:startDate><xbrli:endDate>2024-12-31</xbrli:endDate></xbrli:period>
  </xbrli:context>
  <xbrli:context id="FY2024_Manufacturing">
    <xbrli:entity><xbrli:identifier scheme="http://csrc.example">000001</xbrli:identifier></xbrli:entity>
    <xbrli:period><xbrli:instant>2024-12-31</xbrli:instant></xbrli:period>
    <xbrli:scenario>
      <xbrldi:explicitMember dimension="cn:IndustryAxis">cn:ManufacturingMember</xbrldi:explicitMember>
    </xbrli:scenario>
  </xbrli:context>
  <xbrli:unit id="CNY"><xbrli:measure>iso4217:CNY</xbrli:measure></xbrli:unit>
  <cn:FundCode contextRef="AsOf">000001</cn:FundCode>
  <cn:NetAssetsValue contextRef="AsOf" unitRef="CNY" decimals="-2">1234567890.12</cn:NetAssetsValue>
  <cn:IndustryMarketValue contextRef="FY2024_Manufacturing" unitRef="CNY" decimals="2">5000000.00</cn:IndustryMarketValue>
</xbrli:xbrl>"#;

    #[test]
    fn extracts_all_facts_with_refs() {
        let instance = parse_instance(INSTANCE).unwrap();
        assert_eq!(instance.facts.len(), 3);

        let nav = instance
            .facts
            .iter()
            .find(|f| f.concept == "cn:NetAssetsValue")
            .unwrap();
        assert_eq!(nav.context_ref, "AsOf");
        assert_eq!(nav.unit_ref.as_deref(), Some("CNY"));
        assert_eq!(nav.decimals, Some(-2));
        assert_eq!(nav.value_raw, "1234567890.12");
    }

    #[test]
    fn resolves_contexts_and_dimensions() {
        let instance = parse_instance(INSTANCE).unwrap();
        assert_eq!(instance.contexts.len(), 3);

        let as_of = &instance.contexts["AsOf"];
        assert_eq!(as_of.entity_identifier.as_deref(), Some("000001"));
        assert_eq!(
            as_of.period,
            Period::Instant {
                at: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
            }
        );

        let fy = &instance.contexts["FY2024"];
        assert_eq!(
            fy.period,
            Period::Duration {
                start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
            }
        );

        let dimensioned = &instance.contexts["FY2024_Manufacturing"];
        assert_eq!(
            dimensioned.dimensions.get("cn:IndustryAxis").map(String::as_str),
            Some("cn:ManufacturingMember")
        );
    }

    #[test]
    fn units_and_schema_ref() {
        let instance = parse_instance(INSTANCE).unwrap();
        assert_eq!(instance.units.get("CNY").map(String::as_str), Some("iso4217:CNY"));
        assert_eq!(
            instance.schema_ref.as_deref(),
            Some("http://csrc.example/csrc-mf-general-2021.xsd")
        );
    }

    #[test]
    fn accepts_lowercase_attribute_variants() {
        let xml = r#"<xbrl xmlns:cn="http://csrc.example/mf">
  <context id="c1"><period><startdate>2024-01-01</startdate><enddate>2024-06-30</enddate></period></context>
  <cn:fundcode contextref="c1">000001</cn:fundcode>
</xbrl>"#;
        let instance = parse_instance(xml).unwrap();
        assert_eq!(instance.facts.len(), 1);
        assert_eq!(instance.facts[0].context_ref, "c1");
        assert_eq!(
            instance.contexts["c1"].period,
            Period::Duration {
                start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
            }
        );
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(matches!(
            parse_instance("<xbrl><unclosed"),
            Err(ParseError::Xml(_))
        ));
    }
}
