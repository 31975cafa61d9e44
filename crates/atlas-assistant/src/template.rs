//! Restricted template language for skill steps.
//!
//! Templates reference context through `{{var}}` placeholders. Instead
//! of string-eval, templates are parsed into a typed segment list and
//! every variable is validated against a whitelist:
//!
//! - `user_input`, `history`
//! - `last_step_result`, `last_step_result_raw`
//! - `step_N_result`, `step_N_result_raw`
//! - `step_N_<field>` — only fields a json-mode step actually produced
//!
//! Analysis instructions additionally forbid `user_input`/`history` and
//! may only reference strictly prior steps. Rendered values are capped
//! at 8000 chars to bound prompt size.

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

/// Per-value render cap.
pub const MAX_VALUE_CHARS: usize = 8000;

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("disallowed template variable: {0}")]
    Disallowed(String),

    #[error("template variable not available (step not in json mode): {0}")]
    NotAvailable(String),

    #[error("analysis instruction cannot reference: {0}")]
    ForbiddenInAnalysis(String),

    #[error("analysis instruction references future step: {0}")]
    FutureStep(String),

    #[error("json args template must produce a JSON object")]
    NotAnObject,

    #[error("json args template is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Typed template AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Var(String),
}

/// Scan `{{ident}}` placeholders. Anything that is not a well-formed
/// identifier braces pair stays literal text.
pub fn parse_template(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let ident = after[..end].trim();
        let is_ident = !ident.is_empty()
            && ident
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if is_ident {
            literal.push_str(&rest[..start]);
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Var(ident.to_string()));
            rest = &after[end + 2..];
        } else {
            // Not a variable; keep the braces literal and move on.
            literal.push_str(&rest[..start + 2]);
            rest = after;
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// A variable reference, classified.
#[derive(Debug, Clone, PartialEq)]
enum VarKind {
    UserInput,
    History,
    LastResult,
    LastResultRaw,
    StepResult(usize),
    StepResultRaw(usize),
    StepField(usize, String),
    Unknown,
}

fn classify(name: &str) -> VarKind {
    match name {
        "user_input" => return VarKind::UserInput,
        "history" => return VarKind::History,
        "last_step_result" => return VarKind::LastResult,
        "last_step_result_raw" => return VarKind::LastResultRaw,
        _ => {}
    }
    let Some(tail) = name.strip_prefix("step_") else {
        return VarKind::Unknown;
    };
    let Some((num, field)) = tail.split_once('_') else {
        return VarKind::Unknown;
    };
    let Ok(step_no) = num.parse::<usize>() else {
        return VarKind::Unknown;
    };
    match field {
        "result" => VarKind::StepResult(step_no),
        "result_raw" => VarKind::StepResultRaw(step_no),
        other if !other.is_empty() => VarKind::StepField(step_no, other.to_string()),
        _ => VarKind::Unknown,
    }
}

/// Execution context the templates read from.
#[derive(Debug, Default)]
pub struct TemplateContext {
    pub user_input: String,
    pub history_text: String,
    /// `step_N_result`, `step_N_result_raw`, `step_N_<field>`, plus the
    /// `last_step_result[_raw]` aliases.
    pub values: HashMap<String, serde_json::Value>,
    /// Fields each json-mode step actually produced.
    pub allowed_fields: HashMap<usize, Vec<String>>,
}

impl TemplateContext {
    fn value_of(&self, name: &str) -> serde_json::Value {
        self.values
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::String(String::new()))
    }

    /// Resolve a variable for text/json rendering. `Err` for hard
    /// violations, `Ok(None)` for unknown names (rendered empty).
    fn resolve(&self, name: &str) -> Result<Option<serde_json::Value>, TemplateError> {
        match classify(name) {
            VarKind::UserInput => Ok(Some(serde_json::Value::String(self.user_input.clone()))),
            VarKind::History => Ok(Some(serde_json::Value::String(self.history_text.clone()))),
            VarKind::LastResult | VarKind::LastResultRaw => Ok(Some(self.value_of(name))),
            VarKind::StepResult(_) | VarKind::StepResultRaw(_) => Ok(Some(self.value_of(name))),
            VarKind::StepField(step_no, field) => {
                match self.allowed_fields.get(&step_no) {
                    Some(allowed) if allowed.iter().any(|f| f == &field) => {
                        Ok(Some(self.value_of(name)))
                    }
                    Some(_) => Err(TemplateError::Disallowed(name.to_string())),
                    None => Err(TemplateError::NotAvailable(name.to_string())),
                }
            }
            VarKind::Unknown => {
                warn!(var = name, "unknown template variable");
                Ok(None)
            }
        }
    }
}

fn cap(s: String) -> String {
    if s.chars().count() <= MAX_VALUE_CHARS {
        return s;
    }
    s.chars().take(MAX_VALUE_CHARS).collect()
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Free-form text substitution (custom args templates, prompts).
pub fn render_text(template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let mut out = String::new();
    for segment in parse_template(template) {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Var(name) => {
                let value = ctx.resolve(&name)?.unwrap_or_default();
                out.push_str(&cap(value_to_text(&value)));
            }
        }
    }
    Ok(cap(out))
}

/// Analysis instructions: no user input, no history, no future steps,
/// and step fields must be whitelisted by a prior json-mode step.
pub fn render_instruction(
    template: &str,
    ctx: &TemplateContext,
    step_index: usize,
) -> Result<String, TemplateError> {
    let mut out = String::new();
    for segment in parse_template(template) {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Var(name) => {
                match classify(&name) {
                    VarKind::UserInput | VarKind::History => {
                        return Err(TemplateError::ForbiddenInAnalysis(name));
                    }
                    VarKind::StepResult(n)
                    | VarKind::StepResultRaw(n)
                    | VarKind::StepField(n, _)
                        if n >= step_index =>
                    {
                        return Err(TemplateError::FutureStep(name));
                    }
                    VarKind::Unknown => continue,
                    _ => {}
                }
                let value = ctx.resolve(&name)?.unwrap_or_default();
                out.push_str(&cap(value_to_text(&value)));
            }
        }
    }
    Ok(cap(out))
}

/// JSON substitution: every value is JSON-escaped during substitution,
/// the rendered text must parse to a JSON object, and unknown keys are
/// filtered by the tool's schema when known.
pub fn render_json(
    template: &str,
    ctx: &TemplateContext,
    allowed_keys: Option<&[String]>,
) -> Result<serde_json::Map<String, serde_json::Value>, TemplateError> {
    let mut rendered = String::new();
    for segment in parse_template(template) {
        match segment {
            Segment::Literal(text) => rendered.push_str(&text),
            Segment::Var(name) => {
                let value = ctx.resolve(&name)?.unwrap_or_default();
                let capped = match value {
                    serde_json::Value::String(s) => serde_json::Value::String(cap(s)),
                    other => other,
                };
                rendered.push_str(
                    &serde_json::to_string(&capped)
                        .map_err(|e| TemplateError::InvalidJson(e.to_string()))?,
                );
            }
        }
    }

    let parsed: serde_json::Value = serde_json::from_str(&rendered)
        .map_err(|e| TemplateError::InvalidJson(e.to_string()))?;
    let serde_json::Value::Object(mut obj) = parsed else {
        return Err(TemplateError::NotAnObject);
    };

    if let Some(allowed) = allowed_keys {
        obj.retain(|k, _| allowed.iter().any(|a| a == k));
    }
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_step1() -> TemplateContext {
        let mut ctx = TemplateContext {
            user_input: "record this".to_string(),
            history_text: "user: hi".to_string(),
            ..Default::default()
        };
        ctx.values.insert(
            "step_1_result".into(),
            serde_json::Value::String("raw text".into()),
        );
        ctx.values.insert(
            "step_1_title".into(),
            serde_json::Value::String("A \"quoted\" title".into()),
        );
        ctx.values
            .insert("step_1_count".into(), serde_json::json!(3));
        ctx.allowed_fields
            .insert(1, vec!["title".into(), "count".into()]);
        ctx
    }

    #[test]
    fn parser_produces_typed_segments() {
        let segments = parse_template("ask: {{user_input}}!");
        assert_eq!(
            segments,
            vec![
                Segment::Literal("ask: ".into()),
                Segment::Var("user_input".into()),
                Segment::Literal("!".into()),
            ]
        );
        // Malformed placeholders stay literal.
        assert_eq!(
            parse_template("{{not valid}}"),
            vec![Segment::Literal("{{not valid}}".into())]
        );
    }

    #[test]
    fn text_rendering_substitutes_whitelisted_vars() {
        let ctx = ctx_with_step1();
        let out = render_text("in: {{user_input}} / t: {{step_1_title}}", &ctx).unwrap();
        assert_eq!(out, "in: record this / t: A \"quoted\" title");
    }

    #[test]
    fn unknown_vars_render_empty_in_text_mode() {
        let ctx = ctx_with_step1();
        assert_eq!(render_text("x{{bogus_var}}y", &ctx).unwrap(), "xy");
    }

    #[test]
    fn undeclared_field_is_a_hard_error() {
        let ctx = ctx_with_step1();
        assert_eq!(
            render_text("{{step_1_secret}}", &ctx),
            Err(TemplateError::Disallowed("step_1_secret".into()))
        );
        // Step 2 never produced json output at all.
        assert_eq!(
            render_text("{{step_2_title}}", &ctx),
            Err(TemplateError::NotAvailable("step_2_title".into()))
        );
    }

    #[test]
    fn declared_but_missing_field_renders_empty() {
        let mut ctx = ctx_with_step1();
        // "count" is declared; remove its value to simulate the LLM
        // omitting it.
        ctx.values.remove("step_1_count");
        assert_eq!(render_text("[{{step_1_count}}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn analysis_rejects_user_input_history_and_future_steps() {
        let ctx = ctx_with_step1();
        assert_eq!(
            render_instruction("{{user_input}}", &ctx, 2),
            Err(TemplateError::ForbiddenInAnalysis("user_input".into()))
        );
        assert_eq!(
            render_instruction("{{history}}", &ctx, 2),
            Err(TemplateError::ForbiddenInAnalysis("history".into()))
        );
        assert_eq!(
            render_instruction("{{step_2_result}}", &ctx, 2),
            Err(TemplateError::FutureStep("step_2_result".into()))
        );
        // Prior whitelisted field is fine.
        assert_eq!(
            render_instruction("t={{step_1_title}}", &ctx, 2).unwrap(),
            "t=A \"quoted\" title"
        );
    }

    #[test]
    fn json_rendering_escapes_values() {
        let ctx = ctx_with_step1();
        let obj = render_json(
            r#"{"title": {{step_1_title}}, "n": {{step_1_count}}, "q": {{user_input}}}"#,
            &ctx,
            None,
        )
        .unwrap();
        assert_eq!(obj["title"], "A \"quoted\" title");
        assert_eq!(obj["n"], 3);
        assert_eq!(obj["q"], "record this");
    }

    #[test]
    fn json_rendering_rejects_non_objects() {
        let ctx = ctx_with_step1();
        assert_eq!(
            render_json(r#"[{{step_1_title}}]"#, &ctx, None),
            Err(TemplateError::NotAnObject)
        );
    }

    #[test]
    fn json_rendering_filters_unknown_keys() {
        let ctx = ctx_with_step1();
        let allowed = vec!["title".to_string()];
        let obj = render_json(
            r#"{"title": {{step_1_title}}, "junk": 1}"#,
            &ctx,
            Some(&allowed),
        )
        .unwrap();
        assert!(obj.contains_key("title"));
        assert!(!obj.contains_key("junk"));
    }

    #[test]
    fn rendered_values_are_length_capped() {
        let mut ctx = TemplateContext::default();
        ctx.user_input = "x".repeat(MAX_VALUE_CHARS * 2);
        let out = render_text("{{user_input}}", &ctx).unwrap();
        assert_eq!(out.chars().count(), MAX_VALUE_CHARS);
    }
}
