use crate::mapping::MAP_FUNCTION;
use serde::Serialize;
use tracing::{debug, warn};

/// How far past (or before) an anchor a co-occurrence constraint may look.
pub const SIGNATURE_WINDOW: usize = 200;

/// One exact old -> new substitution found in the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchPoint {
    pub name: String,
    pub old: String,
    pub new: String,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    /// Byte offset of `point.old` in the scanned content.
    pub start: usize,
    pub point: PatchPoint,
}

impl SignatureMatch {
    pub fn end(&self) -> usize {
        self.start + self.point.old.len()
    }

    fn overlaps(&self, other: &SignatureMatch) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// A structural shape to look for in minified source.
///
/// `find` returns the first occurrence that satisfies every constraint, with
/// `old` copied verbatim from the content.
pub trait SignatureMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn find(&self, content: &str) -> Option<SignatureMatch>;

    /// The exact rule for the release this signature was written against.
    /// Used where adaptive scanning is unavailable.
    fn fixed_rule(&self) -> Option<PatchPoint> {
        None
    }
}

/// Ordered set of independent matchers.
pub struct Discoverer {
    matchers: Vec<Box<dyn SignatureMatcher>>,
}

impl Default for Discoverer {
    fn default() -> Self {
        Self::standard()
    }
}

impl Discoverer {
    pub fn standard() -> Self {
        Self::with_matchers(vec![
            Box::new(StreamingGeneratorMatcher),
            Box::new(AnsiStripMatcher),
            Box::new(ClientFactoryMatcher),
        ])
    }

    pub fn with_matchers(matchers: Vec<Box<dyn SignatureMatcher>>) -> Self {
        Self { matchers }
    }

    pub fn push(&mut self, matcher: Box<dyn SignatureMatcher>) {
        self.matchers.push(matcher);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    /// Runs every matcher against `content`. The result follows matcher
    /// order, never scan order.
    pub fn discover(&self, content: &str) -> Vec<PatchPoint> {
        let mut accepted: Vec<SignatureMatch> = Vec::new();

        for matcher in &self.matchers {
            let Some(found) = matcher.find(content) else {
                debug!(signature = matcher.name(), "signature not found");
                continue;
            };

            // Callers replace the first occurrence of `old`; it has to be this one.
            if content.find(&found.point.old) != Some(found.start) {
                warn!(
                    signature = matcher.name(),
                    offset = found.start,
                    "matched text also occurs earlier in the file, skipping"
                );
                continue;
            }
            if accepted.iter().any(|prior| prior.overlaps(&found)) {
                warn!(
                    signature = matcher.name(),
                    offset = found.start,
                    "match overlaps an earlier signature, skipping"
                );
                continue;
            }

            debug!(signature = matcher.name(), offset = found.start, "signature matched");
            accepted.push(found);
        }

        accepted.into_iter().map(|m| m.point).collect()
    }

    pub fn fixed_rules(&self) -> Vec<PatchPoint> {
        self.matchers.iter().filter_map(|m| m.fixed_rule()).collect()
    }
}

pub fn discover_patch_points(content: &str) -> Vec<PatchPoint> {
    Discoverer::standard().discover(content)
}

/// Entry of the main conversation generator:
/// `async function*<f>(A,Q,B){let G=<g>(B)` with `model:B.model` in the body.
pub struct StreamingGeneratorMatcher;

impl StreamingGeneratorMatcher {
    const ANCHOR: &'static str = "async function*";
    const PARAMS: &'static str = "(A,Q,B){";
    const MODEL_USE: &'static str = "model:B.model";
    const BINDING: &'static str = "let G=";
    const CALL: &'static str = "(B)";
}

impl SignatureMatcher for StreamingGeneratorMatcher {
    fn name(&self) -> &'static str {
        "streaming-generator"
    }

    fn find(&self, content: &str) -> Option<SignatureMatch> {
        for (start, _) in content.match_indices(Self::ANCHOR) {
            let snippet = window_after(content, start, SIGNATURE_WINDOW);
            if !snippet.contains(Self::MODEL_USE) {
                continue;
            }
            let Some(params) = snippet.find(Self::PARAMS) else {
                continue;
            };
            if !is_identifier(&snippet[Self::ANCHOR.len()..params]) {
                continue;
            }

            let body = params + Self::PARAMS.len();
            let Some(binding) = snippet[body..].find(Self::BINDING) else {
                continue;
            };
            let callee_at = body + binding + Self::BINDING.len();
            let Some(call) = snippet[callee_at..].find(Self::CALL) else {
                continue;
            };
            if !is_identifier(&snippet[callee_at..callee_at + call]) {
                continue;
            }
            let end = callee_at + call + Self::CALL.len();

            return Some(SignatureMatch {
                start,
                point: PatchPoint {
                    name: self.name().to_string(),
                    old: snippet[..end].to_string(),
                    new: format!(
                        "{}B.model={MAP_FUNCTION}(B.model);{}",
                        &snippet[..body],
                        &snippet[body..end]
                    ),
                    rationale: "Map model ID at entry of main conversation streaming function"
                        .to_string(),
                },
            });
        }
        None
    }
}

/// ANSI-stripping helper whose result is used as the request model:
/// `function <f>(A){return A.replace(/\[(1|2)m\]/gi,"")}`.
pub struct AnsiStripMatcher;

impl AnsiStripMatcher {
    const EXPR: &'static str = r#"A.replace(/\[(1|2)m\]/gi,"")"#;
    const ANCHOR: &'static str = r#"){return A.replace(/\[(1|2)m\]/gi,"")}"#;
    const PREFIX: &'static str = "function ";
    const PARAM: &'static str = "(A";

    fn rewrite(head: &str) -> String {
        format!("{head}){{return {MAP_FUNCTION}({})}}", Self::EXPR)
    }
}

impl SignatureMatcher for AnsiStripMatcher {
    fn name(&self) -> &'static str {
        "ansi-strip-model"
    }

    fn find(&self, content: &str) -> Option<SignatureMatch> {
        for (anchor_at, _) in content.match_indices(Self::ANCHOR) {
            let Some(start) = named_prefix_before(content, anchor_at, Self::PREFIX, Self::PARAM)
            else {
                continue;
            };
            let end = anchor_at + Self::ANCHOR.len();
            return Some(SignatureMatch {
                start,
                point: PatchPoint {
                    name: self.name().to_string(),
                    old: content[start..end].to_string(),
                    new: Self::rewrite(&content[start..anchor_at]),
                    rationale: "Wrap ANSI strip function return with model mapping (used as model:<f>(X))"
                        .to_string(),
                },
            });
        }
        None
    }

    fn fixed_rule(&self) -> Option<PatchPoint> {
        let head = "function Gu(A";
        Some(PatchPoint {
            name: self.name().to_string(),
            old: format!("{head}{}", Self::ANCHOR),
            new: Self::rewrite(head),
            rationale: "Fixed ANSI strip rewrite for copilot-chat 0.37.x".to_string(),
        })
    }
}

/// SDK client factory:
/// `async function <f>({apiKey:A,maxRetries:Q,model:B,fetchOverride:G}){let Z=`.
pub struct ClientFactoryMatcher;

impl ClientFactoryMatcher {
    const ANCHOR: &'static str = "({apiKey:A,maxRetries:Q,model:B,fetchOverride:G}){let Z=";
    const PREFIX: &'static str = "async function ";
    const BINDING: &'static str = "let Z=";

    fn rewrite(old: &str) -> String {
        let split = old.len() - Self::BINDING.len();
        format!(
            r#"{}B={MAP_FUNCTION}(B||"");{}"#,
            &old[..split],
            &old[split..]
        )
    }
}

impl SignatureMatcher for ClientFactoryMatcher {
    fn name(&self) -> &'static str {
        "client-factory"
    }

    fn find(&self, content: &str) -> Option<SignatureMatch> {
        for (anchor_at, _) in content.match_indices(Self::ANCHOR) {
            let Some(start) = named_prefix_before(content, anchor_at, Self::PREFIX, "") else {
                continue;
            };
            let old = &content[start..anchor_at + Self::ANCHOR.len()];
            return Some(SignatureMatch {
                start,
                point: PatchPoint {
                    name: self.name().to_string(),
                    old: old.to_string(),
                    new: Self::rewrite(old),
                    rationale: "Map model ID at entry of SDK client factory".to_string(),
                },
            });
        }
        None
    }

    fn fixed_rule(&self) -> Option<PatchPoint> {
        let old = format!("async function nH{}", Self::ANCHOR);
        Some(PatchPoint {
            name: self.name().to_string(),
            new: Self::rewrite(&old),
            old,
            rationale: "Fixed client factory rewrite for copilot-chat 0.37.x".to_string(),
        })
    }
}

/// Finds `<prefix><identifier><suffix>` ending exactly at `anchor_at` and
/// returns where the prefix starts.
fn named_prefix_before(content: &str, anchor_at: usize, prefix: &str, suffix: &str) -> Option<usize> {
    let from = ceil_char_boundary(content, anchor_at.saturating_sub(SIGNATURE_WINDOW));
    let head = &content[from..anchor_at];
    let prefix_at = head.rfind(prefix)?;
    let name = head[prefix_at + prefix.len()..].strip_suffix(suffix)?;
    is_identifier(name).then_some(from + prefix_at)
}

fn window_after(content: &str, start: usize, len: usize) -> &str {
    let end = floor_char_boundary(content, start.saturating_add(len));
    &content[start..end]
}

fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
