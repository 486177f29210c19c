use log::{info, warn};
use once_cell::sync::Lazy;
use roxmltree::Document;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::ParseError;

const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";

#[derive(Debug, Clone)]
pub struct ConceptMeta {
    pub id: String,
    pub name: String,
    pub datatype: Option<String>,
    pub label_zh: Option<String>,
    pub substitution_group: Option<String>,
    pub is_abstract: bool,
    pub period_type: Option<String>,
}

/// Schema + label-linkbase index for one taxonomy version. Immutable
/// after load; shared read-only between concurrent parses.
#[derive(Debug)]
pub struct Taxonomy {
    pub version: String,
    items: Vec<ConceptMeta>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl Taxonomy {
    /// Load every xs:element and its Chinese label from the version's
    /// directory tree.
    pub fn load(root: &Path, version: &str) -> Result<Taxonomy, ParseError> {
        let dir = root.join(version);
        let mut xsd_files = Vec::new();
        let mut label_files = Vec::new();
        collect_files(&dir, &mut xsd_files, &mut label_files)
            .map_err(|e| ParseError::Extraction(format!("taxonomy dir {:?}: {}", dir, e)))?;

        let mut items: Vec<ConceptMeta> = Vec::new();
        for path in &xsd_files {
            match std::fs::read_to_string(path) {
                Ok(content) => load_xsd(&content, &mut items),
                Err(e) => warn!("skipping unreadable xsd {:?}: {}", path, e),
            }
        }

        let mut labels: HashMap<String, String> = HashMap::new();
        for path in &label_files {
            match std::fs::read_to_string(path) {
                Ok(content) => load_labels(&content, &mut labels),
                Err(e) => warn!("skipping unreadable label linkbase {:?}: {}", path, e),
            }
        }

        for item in items.iter_mut() {
            if let Some(label) = labels.get(&item.id) {
                item.label_zh = Some(label.clone());
            }
        }

        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for (i, item) in items.iter().enumerate() {
            by_id.insert(item.id.to_lowercase(), i);
            by_name.entry(item.name.to_lowercase()).or_insert(i);
        }

        info!(
            "taxonomy {} loaded: {} elements, {} labels",
            version,
            items.len(),
            labels.len()
        );

        Ok(Taxonomy {
            version: version.to_string(),
            items,
            by_id,
            by_name,
        })
    }

    /// Lookup by element id or qualified/local name, case-insensitive
    /// (instances that round-tripped through HTML arrive lowercased).
    pub fn get(&self, concept: &str) -> Option<&ConceptMeta> {
        let key = concept.to_lowercase();
        if let Some(&i) = self.by_id.get(&key) {
            return Some(&self.items[i]);
        }
        if let Some(&i) = self.by_name.get(&key) {
            return Some(&self.items[i]);
        }
        // prefix:Local -> Local
        let local = key.rsplit(':').next().unwrap_or(key.as_str());
        self.by_name.get(local).map(|&i| &self.items[i])
    }

    pub fn label_of(&self, concept: &str) -> Option<&str> {
        self.get(concept).and_then(|m| m.label_zh.as_deref())
    }

    pub fn search_by_label(&self, needle: &str) -> Vec<&ConceptMeta> {
        self.items
            .iter()
            .filter(|m| m.label_zh.as_deref().map_or(false, |l| l.contains(needle)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn collect_files(
    dir: &Path,
    xsd: &mut Vec<PathBuf>,
    labels: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, xsd, labels)?;
        } else if path.extension().map_or(false, |e| e == "xsd") {
            xsd.push(path);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.ends_with("_lab.xml"))
        {
            labels.push(path);
        }
    }
    Ok(())
}

fn load_xsd(content: &str, items: &mut Vec<ConceptMeta>) {
    let doc = match Document::parse(content) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("unparseable xsd skipped: {}", e);
            return;
        }
    };

    for node in doc.descendants().filter(|n| {
        n.is_element() && n.tag_name().name() == "element" && n.tag_name().namespace() == Some(XSD_NS)
    }) {
        let id = match node.attribute("id") {
            Some(id) => id.to_string(),
            None => continue,
        };
        let name = match node.attribute("name") {
            Some(name) => name.to_string(),
            None => continue,
        };
        items.push(ConceptMeta {
            id,
            name,
            datatype: node.attribute("type").map(str::to_string),
            label_zh: None,
            substitution_group: node.attribute("substitutionGroup").map(str::to_string),
            is_abstract: node.attribute("abstract") == Some("true"),
            period_type: node
                .attributes()
                .find(|a| a.name() == "periodType")
                .map(|a| a.value().to_string()),
        });
    }
}

/// Join link:loc -> link:labelArc -> link:label, preferring Chinese
/// labels; unlabeled-language entries are accepted as a fallback.
fn load_labels(content: &str, labels: &mut HashMap<String, String>) {
    let doc = match Document::parse(content) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("unparseable label linkbase skipped: {}", e);
            return;
        }
    };

    let mut loc_map: HashMap<String, String> = HashMap::new();
    let mut label_map: HashMap<String, (String, bool)> = HashMap::new();
    let mut arcs: Vec<(String, String)> = Vec::new();

    for node in doc.descendants().filter(|n| n.is_element()) {
        match node.tag_name().name() {
            "loc" => {
                let href = node.attributes().find(|a| a.name() == "href");
                let label = node.attributes().find(|a| a.name() == "label");
                if let (Some(href), Some(label)) = (href, label) {
                    if let Some((_, fragment)) = href.value().split_once('#') {
                        loc_map.insert(label.value().to_string(), fragment.to_string());
                    }
                }
            }
            "label" => {
                let id = node.attributes().find(|a| a.name() == "label");
                let lang = node
                    .attributes()
                    .find(|a| a.name() == "lang")
                    .map(|a| a.value().to_lowercase())
                    .unwrap_or_default();
                let text = node.text().map(str::trim).unwrap_or_default();
                if let Some(id) = id {
                    if !text.is_empty() {
                        let is_zh = lang.contains("zh") || lang.is_empty();
                        let entry = label_map
                            .entry(id.value().to_string())
                            .or_insert_with(|| (text.to_string(), is_zh));
                        // A Chinese label wins over an earlier fallback.
                        if is_zh && !entry.1 {
                            *entry = (text.to_string(), true);
                        }
                    }
                }
            }
            "labelArc" => {
                let from = node.attributes().find(|a| a.name() == "from");
                let to = node.attributes().find(|a| a.name() == "to");
                if let (Some(from), Some(to)) = (from, to) {
                    arcs.push((from.value().to_string(), to.value().to_string()));
                }
            }
            _ => {}
        }
    }

    for (from, to) in arcs {
        if let (Some(element_id), Some((text, _))) = (loc_map.get(&from), label_map.get(&to)) {
            labels.insert(element_id.clone(), text.clone());
        }
    }
}

/// Process-wide taxonomy cache keyed by version. The load guard ensures a
/// version is loaded once even under concurrent first use.
static CACHE: Lazy<RwLock<HashMap<String, Arc<Taxonomy>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static LOAD_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Debug, Clone)]
pub struct TaxonomyCache {
    root: PathBuf,
}

impl TaxonomyCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TaxonomyCache { root: root.into() }
    }

    /// Shared handle for a version; None when the version's tree is not
    /// on disk (the mapper then degrades to concept-local labels).
    pub fn get_or_load(&self, version: &str) -> Option<Arc<Taxonomy>> {
        if let Some(found) = CACHE.read().expect("taxonomy cache poisoned").get(version) {
            return Some(Arc::clone(found));
        }

        let _guard = LOAD_GUARD.lock().expect("taxonomy load guard poisoned");
        // Another parse may have loaded it while we waited.
        if let Some(found) = CACHE.read().expect("taxonomy cache poisoned").get(version) {
            return Some(Arc::clone(found));
        }

        match Taxonomy::load(&self.root, version) {
            Ok(taxonomy) => {
                let shared = Arc::new(taxonomy);
                CACHE
                    .write()
                    .expect("taxonomy cache poisoned")
                    .insert(version.to_string(), Arc::clone(&shared));
                Some(shared)
            }
            Err(e) => {
                warn!("taxonomy {} unavailable: {}", version, e);
                None
            }
        }
    }
}
