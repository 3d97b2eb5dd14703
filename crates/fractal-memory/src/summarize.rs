//! Batch summarisation for L0 → L1 consolidation.
//!
//! The external summariser is expected to answer with a JSON object carrying
//! `summary`, `importance` and `source_count`. Models wrap JSON in code
//! fences or prefix it with prose often enough that the response is coerced
//! before parsing; when coercion still fails, a deterministic fallback is
//! built from the batch itself.

use serde::Deserialize;
use tracing::warn;

use fractal_core::traits::CompletionProvider;
use fractal_core::types::Episode;
use fractal_core::util::first_sentence;

const SYSTEM_PROMPT: &str = "You are a data processor. Output ONLY valid JSON.";
const MAX_FALLBACK_LEN: usize = 2_000;

/// Synthesised summary of one L0 batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub summary: String,
    pub importance: f64,
    pub source_count: usize,
}

#[derive(Deserialize)]
struct SummaryResponse {
    summary: String,
    importance: Option<f64>,
    source_count: Option<usize>,
}

/// Summarise a batch, preferring the provider and falling back to the
/// deterministic summary on any failure.
pub async fn summarize_batch(
    provider: Option<&dyn CompletionProvider>,
    items: &[Episode],
) -> BatchSummary {
    let fallback = fallback_summary(items);

    let Some(provider) = provider else {
        return fallback;
    };

    let prompt = build_prompt(items);
    match provider.complete(SYSTEM_PROMPT, &prompt).await {
        Ok(raw) => coerce_response(&raw, items.len()).unwrap_or_else(|| {
            warn!("Summariser response was not coercible to JSON, using fallback");
            fallback
        }),
        Err(e) => {
            warn!(error = %e, "Summariser call failed, using fallback");
            fallback
        }
    }
}

fn build_prompt(items: &[Episode]) -> String {
    let mut lines = Vec::with_capacity(items.len());
    for item in items {
        for line in item.content.lines() {
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line);
            }
        }
    }
    format!(
        "DATA:\n{}\n\nTASK: Summarize the data into a single 3rd-person paragraph.\n\
         FORMAT: {{\"summary\": \"The user discussed...\", \"importance\": 0.7, \"source_count\": {}}}\n\
         CONSTRAINT: Do not use timestamps or role labels in the summary value.",
        lines.join("\n"),
        items.len()
    )
}

/// Coerce a model response into a `BatchSummary`: strip code fences and any
/// non-JSON prefix, then parse.
pub fn coerce_response(raw: &str, batch_len: usize) -> Option<BatchSummary> {
    let stripped = strip_code_fences(raw);
    let json_start = stripped.find('{')?;
    let candidate = &stripped[json_start..];

    let parsed: SummaryResponse = serde_json::from_str(candidate).ok()?;
    let summary = parsed.summary.trim().to_string();
    if summary.is_empty() {
        return None;
    }
    Some(BatchSummary {
        summary,
        importance: parsed.importance.unwrap_or(0.5).clamp(0.0, 1.0),
        source_count: parsed.source_count.unwrap_or(batch_len),
    })
}

fn strip_code_fences(text: &str) -> &str {
    let mut t = text.trim();
    if let Some((_, rest)) = t.split_once("```json") {
        t = rest;
    } else if let Some((_, rest)) = t.split_once("```") {
        t = rest;
    }
    if let Some((body, _)) = t.rsplit_once("```") {
        t = body;
    }
    t.trim()
}

/// Deterministic fallback: concatenated first sentences, importance = mean
/// of inputs.
pub fn fallback_summary(items: &[Episode]) -> BatchSummary {
    let mut summary = String::new();
    for item in items {
        let sentence = first_sentence(&item.content);
        if sentence.is_empty() {
            continue;
        }
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(sentence);
        if summary.len() >= MAX_FALLBACK_LEN {
            summary.truncate(MAX_FALLBACK_LEN);
            break;
        }
    }
    if summary.is_empty() {
        summary = "Summary unavailable.".into();
    }

    let importance = if items.is_empty() {
        0.5
    } else {
        items.iter().map(|i| i.importance).sum::<f64>() / items.len() as f64
    };

    BatchSummary {
        summary,
        importance: importance.clamp(0.0, 1.0),
        source_count: items.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Vec<Episode> {
        vec![
            Episode::new("u", "The deploy finished. Everything is green.", 0.9),
            Episode::new("u", "Rollback plan confirmed", 0.7),
        ]
    }

    #[test]
    fn coerces_plain_json() {
        let got = coerce_response(
            r#"{"summary": "The user shipped a deploy.", "importance": 0.8, "source_count": 2}"#,
            2,
        )
        .unwrap();
        assert_eq!(got.summary, "The user shipped a deploy.");
        assert_eq!(got.importance, 0.8);
        assert_eq!(got.source_count, 2);
    }

    #[test]
    fn coerces_fenced_json_with_prefix() {
        let raw = "Sure! Here is the result:\n```json\n{\"summary\": \"Deploy recap.\"}\n```\n";
        let got = coerce_response(raw, 3).unwrap();
        assert_eq!(got.summary, "Deploy recap.");
        // Missing fields get defaults
        assert_eq!(got.importance, 0.5);
        assert_eq!(got.source_count, 3);
    }

    #[test]
    fn rejects_non_json() {
        assert!(coerce_response("no json here at all", 1).is_none());
        assert!(coerce_response("{\"summary\": \"\"}", 1).is_none());
    }

    #[test]
    fn importance_is_clamped() {
        let got = coerce_response(r#"{"summary": "x", "importance": 7.5}"#, 1).unwrap();
        assert_eq!(got.importance, 1.0);
    }

    #[test]
    fn fallback_concatenates_first_sentences() {
        let got = fallback_summary(&batch());
        assert_eq!(got.summary, "The deploy finished. Rollback plan confirmed");
        assert!((got.importance - 0.8).abs() < 1e-9);
        assert_eq!(got.source_count, 2);
    }

    #[test]
    fn fallback_on_empty_batch() {
        let got = fallback_summary(&[]);
        assert_eq!(got.summary, "Summary unavailable.");
        assert_eq!(got.source_count, 0);
    }

    #[tokio::test]
    async fn no_provider_uses_fallback() {
        let got = summarize_batch(None, &batch()).await;
        assert_eq!(got.summary, "The deploy finished. Rollback plan confirmed");
    }
}
