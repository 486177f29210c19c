pub mod detector;
pub mod html;
pub mod ixbrl;
pub mod llm;
pub mod mapper;
pub mod taxonomy;
pub mod xbrl;

use log::{info, warn};
use rust_decimal::Decimal;
use std::path::Path;

use crate::core::config::IngestConfig;
use crate::error::{ErrorKind, ParseError};
use crate::model::{AttemptOutcome, ParseAttempt, ParseHints, ParseResult, ParsedFundReport, ParserKind};
use detector::{detect, DocumentFormat};
use llm::LlmExtractor;
use mapper::MappingRegistry;
use taxonomy::TaxonomyCache;

const LLM_CONFIDENCE_CAP: Decimal = Decimal::from_parts(6, 0, 0, false, 1); // 0.6

/// Routes an artifact through the extraction paths in a fixed fallback
/// order and records every attempt. Entirely synchronous; callers run it
/// on a blocking worker.
pub struct ParserFacade {
    mappings: MappingRegistry,
    taxonomies: TaxonomyCache,
    llm: Option<Box<dyn LlmExtractor>>,
}

impl ParserFacade {
    pub fn new(config: &IngestConfig) -> Result<Self, ParseError> {
        let mappings =
            MappingRegistry::load_dir(&config.mapping_dir, &config.default_taxonomy_version)?;
        Ok(ParserFacade {
            mappings,
            taxonomies: TaxonomyCache::new(&config.taxonomy_dir),
            llm: None,
        })
    }

    /// Install the optional last-resort extractor.
    pub fn with_llm(mut self, llm: Box<dyn LlmExtractor>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn parse_file(&self, path: &Path, hints: &ParseHints) -> ParseResult {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) => {
                return ParseResult {
                    report: None,
                    warnings: vec![format!("could not read {:?}: {}", path, e)],
                    attempted: Vec::new(),
                }
            }
        };
        self.parse_bytes(&content, Some(path), hints)
    }

    pub fn parse_bytes(&self, content: &[u8], path: Option<&Path>, hints: &ParseHints) -> ParseResult {
        let detection = detect(content, path);
        info!(
            "detected format {:?} (confidence {:.2}) for {:?}",
            detection.format, detection.confidence, path
        );

        let mut attempted: Vec<ParseAttempt> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        // 1. iXBRL: unwrap the embedded instance, then the XBRL path.
        if detection.format == DocumentFormat::Ixbrl {
            match ixbrl::extract(content) {
                Some(xml) => match self.parse_xbrl(&xml, hints) {
                    Ok(report) => {
                        attempted.push(ok_attempt(ParserKind::Ixbrl));
                        return success(report, warnings, attempted);
                    }
                    Err(e) => attempted.push(failed_attempt(ParserKind::Ixbrl, &e)),
                },
                None => attempted.push(ParseAttempt {
                    kind: ParserKind::Ixbrl,
                    outcome: AttemptOutcome::Failed {
                        kind: ErrorKind::Parse,
                        message: "no embedded xbrl instance found".to_string(),
                    },
                }),
            }
        }

        // 2. Plain XBRL.
        if detection.format == DocumentFormat::Xbrl {
            let text = String::from_utf8_lossy(content);
            match self.parse_xbrl(text.as_bytes(), hints) {
                Ok(report) => {
                    attempted.push(ok_attempt(ParserKind::Xbrl));
                    return success(report, warnings, attempted);
                }
                Err(e) => attempted.push(failed_attempt(ParserKind::Xbrl, &e)),
            }
        }

        if detection.format == DocumentFormat::Unknown {
            attempted.push(ParseAttempt {
                kind: ParserKind::Xbrl,
                outcome: AttemptOutcome::Failed {
                    kind: ErrorKind::Format,
                    message: "format not classifiable".to_string(),
                },
            });
        }

        // 3. HTML table scraping, also the net under the tagged paths.
        let text = String::from_utf8_lossy(content);
        match html::parse(&text, hints) {
            Ok(report) => {
                attempted.push(ok_attempt(ParserKind::Html));
                return success(report, warnings, attempted);
            }
            Err(e) => attempted.push(failed_attempt(ParserKind::Html, &e)),
        }

        // 4. Optional LLM-assisted extraction, confidence-capped.
        if let Some(llm) = &self.llm {
            match llm.extract(&text, hints) {
                Ok(mut report) => {
                    report.parser_kind = ParserKind::Llm;
                    if report.confidence > LLM_CONFIDENCE_CAP {
                        report.confidence = LLM_CONFIDENCE_CAP;
                    }
                    attempted.push(ok_attempt(ParserKind::Llm));
                    warnings.push(format!("extracted by {}", llm.name()));
                    return success(report, warnings, attempted);
                }
                Err(e) => attempted.push(failed_attempt(ParserKind::Llm, &e)),
            }
        }

        warn!("all parsers failed for {:?}", path);
        ParseResult {
            report: None,
            warnings,
            attempted,
        }
    }

    /// The standards path: extract facts, pick the taxonomy version from
    /// the schemaRef, apply the version's concept map.
    fn parse_xbrl(&self, xml: &[u8], hints: &ParseHints) -> Result<ParsedFundReport, ParseError> {
        let text = String::from_utf8_lossy(xml);
        let instance = xbrl::parse_instance(&text)?;
        if instance.facts.is_empty() {
            return Err(ParseError::Extraction(
                "instance contains no facts".to_string(),
            ));
        }

        let (version, config) = self.mappings.select(instance.schema_ref.as_deref());
        let taxonomy = self.taxonomies.get_or_load(version);

        let mut report = mapper::map_instance(&instance, config, taxonomy.as_deref(), hints)?;
        report.taxonomy_version = Some(version.to_string());
        Ok(report)
    }
}

fn ok_attempt(kind: ParserKind) -> ParseAttempt {
    ParseAttempt {
        kind,
        outcome: AttemptOutcome::Ok,
    }
}

fn failed_attempt(kind: ParserKind, error: &ParseError) -> ParseAttempt {
    ParseAttempt {
        kind,
        outcome: AttemptOutcome::Failed {
            kind: error.kind(),
            message: error.to_string(),
        },
    }
}

fn success(
    report: ParsedFundReport,
    mut warnings: Vec<String>,
    attempted: Vec<ParseAttempt>,
) -> ParseResult {
    warnings.extend(report.warnings.iter().cloned());
    ParseResult {
        report: Some(report),
        warnings,
        attempted,
    }
}
