//! Prompt construction and response parsing for the text-generation steps.
//!
//! Every request carries the issuing step under the `step` metadata key so
//! providers (and test doubles) can tell the calls apart.

use serde::Deserialize;

use crate::llm::provider::{ChatMessage, CompletionRequest};
use crate::workflow::state::{
    Context, Intent, Message, RunState, Specialist, StepName, TaskResult, Urgency,
};

/// Metadata key naming the step that issued a completion request.
pub const STEP_METADATA_KEY: &str = "step";

const EXTRACT_MAX_TOKENS: u32 = 512;
const CLASSIFY_MAX_TOKENS: u32 = 256;
const SPECIALIST_MAX_TOKENS: u32 = 768;
const WRITER_MAX_TOKENS: u32 = 1024;

/// Body characters included in prompts.
const BODY_PREVIEW_CHARS: usize = 2000;

fn request(step: StepName, system: String, user: String) -> CompletionRequest {
    CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
        .with_metadata(STEP_METADATA_KEY, step.as_str())
}

fn message_block(message: &Message) -> String {
    let mut out = String::with_capacity(512);
    out.push_str(&format!("From: {}\n", message.sender));
    if !message.recipients.is_empty() {
        out.push_str(&format!("To: {}\n", message.recipients.join(", ")));
    }
    if !message.subject.is_empty() {
        out.push_str(&format!("Subject: {}\n", message.subject));
    }
    out.push_str(&format!("Received: {}\n", message.received_at.to_rfc3339()));
    let body: String = message.body.chars().take(BODY_PREVIEW_CHARS).collect();
    out.push_str(&format!("\nBody:\n{body}\n"));
    out
}

fn context_block(context: Option<&Context>) -> String {
    match context {
        Some(ctx) => format!(
            "Summary: {}\nKey entities: {}\nRequested actions: {}\nUrgency: {:?}\n",
            ctx.summary,
            ctx.key_entities.join(", "),
            ctx.requested_actions.join("; "),
            ctx.urgency
        ),
        None => "No extracted context.\n".to_string(),
    }
}

// ── Intake ──────────────────────────────────────────────────────────

pub fn intake_request(message: &Message) -> CompletionRequest {
    let system = "You extract structured context from emails.\n\n\
        Respond with ONLY a JSON object:\n\
        {\"summary\": \"one sentence\", \"key_entities\": [\"people, companies, projects\"], \
        \"requested_actions\": [\"what the sender asks for\"], \"urgency\": \"low|medium|high\"}"
        .to_string();
    request(StepName::Intake, system, message_block(message))
        .with_temperature(0.0)
        .with_max_tokens(EXTRACT_MAX_TOKENS)
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_entities: Vec<String>,
    #[serde(default)]
    requested_actions: Vec<String>,
    #[serde(default)]
    urgency: String,
}

pub fn parse_context(raw: &str) -> Result<Context, String> {
    let json_str = extract_json_object(raw);
    let response: ContextResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let urgency = match response.urgency.trim().to_lowercase().as_str() {
        "low" => Urgency::Low,
        "high" => Urgency::High,
        _ => Urgency::Medium,
    };
    Ok(Context {
        summary: response.summary.trim().to_string(),
        key_entities: response.key_entities,
        requested_actions: response.requested_actions,
        urgency,
    })
}

// ── Supervisor classification ───────────────────────────────────────

pub fn classify_request(message: &Message, context: Option<&Context>) -> CompletionRequest {
    let system = "You route emails to specialized assistants.\n\n\
        Intents:\n\
        - \"meeting_request\": scheduling, availability, appointments\n\
        - \"document_request\": asks for documents, files, or factual information\n\
        - \"task_delegation\": hands off work involving contacts or customer records\n\
        - \"simple_direct\": anything answerable directly\n\n\
        Specialists: \"calendar\", \"document\", \"crm\". The intent already implies its \
        main specialist; list any others the reply also needs in \"also_needs\".\n\n\
        Respond with ONLY a JSON object:\n\
        {\"intent\": \"...\", \"also_needs\": [], \"rationale\": \"...\"}"
        .to_string();
    let user = format!("{}\n{}", context_block(context), message_block(message));
    request(StepName::Supervisor, system, user)
        .with_temperature(0.0)
        .with_max_tokens(CLASSIFY_MAX_TOKENS)
}

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    intent: String,
    #[serde(default)]
    also_needs: Vec<String>,
}

/// Parse a classification into the intent and any extra specialists.
pub fn parse_classification(raw: &str) -> Result<(Intent, Vec<Specialist>), String> {
    let json_str = extract_json_object(raw);
    let response: ClassificationResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;
    let intent = Intent::parse(&response.intent)
        .ok_or_else(|| format!("unknown intent: '{}'", response.intent))?;
    let extras = response
        .also_needs
        .iter()
        .filter_map(|s| Specialist::parse(s))
        .collect();
    Ok((intent, extras))
}

// ── Specialists ─────────────────────────────────────────────────────

pub fn specialist_request(specialist: Specialist, state: &RunState) -> CompletionRequest {
    let role = match specialist {
        Specialist::Calendar => {
            "You are a scheduling assistant. Work out the meeting details the sender wants \
             and propose concrete times."
        }
        Specialist::Document => {
            "You are a document assistant. Identify the documents or facts the sender \
             requested and summarise what can be provided."
        }
        Specialist::Crm => {
            "You are a CRM assistant. Identify the people and organisations involved and \
             what is known about the relationship."
        }
    };
    let system = format!(
        "{role}\n\nRespond with ONLY a JSON object:\n\
         {{\"summary\": \"what you found, for the reply writer\", \"data\": {{}}}}"
    );
    let user = format!(
        "Intent: {}\n{}\n{}",
        state
            .intent
            .map(|i| i.as_str())
            .unwrap_or("unclassified"),
        context_block(state.context.as_ref()),
        message_block(&state.message)
    );
    request(specialist.step_name(), system, user)
        .with_temperature(0.2)
        .with_max_tokens(SPECIALIST_MAX_TOKENS)
}

#[derive(Debug, Deserialize)]
struct SpecialistResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse specialist output. Plain prose is accepted as the summary.
pub fn parse_task_result(raw: &str) -> Result<TaskResult, String> {
    let json_str = extract_json_object(raw);
    if let Ok(response) = serde_json::from_str::<SpecialistResponse>(&json_str)
        && !response.summary.trim().is_empty()
    {
        return Ok(TaskResult::Completed {
            summary: response.summary.trim().to_string(),
            data: response.data,
        });
    }

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty specialist output".into());
    }
    Ok(TaskResult::Completed {
        summary: trimmed.to_string(),
        data: serde_json::Value::Null,
    })
}

// ── Writer ──────────────────────────────────────────────────────────

pub fn writer_request(state: &RunState) -> CompletionRequest {
    let system = "You write email replies on behalf of the mailbox owner.\n\n\
        Rules:\n\
        - Reply to the sender in plain text, no subject line\n\
        - Use the gathered information where it is available\n\
        - If some information is unavailable, say you will follow up rather than inventing it\n\
        - Apply every piece of reviewer feedback\n\
        - Output only the reply body"
        .to_string();

    let mut user = String::with_capacity(1024);
    if let Some(intent) = state.intent {
        user.push_str(&format!("Intent: {intent}\n"));
    }
    user.push_str(&context_block(state.context.as_ref()));

    if !state.task_results.is_empty() {
        user.push_str("\nGathered information:\n");
        for (specialist, result) in &state.task_results {
            match result {
                TaskResult::Completed { summary, .. } => {
                    user.push_str(&format!("- {specialist}: {summary}\n"));
                }
                TaskResult::Unavailable { .. } => {
                    user.push_str(&format!("- {specialist}: unavailable\n"));
                }
            }
        }
    }

    if !state.feedback.is_empty() {
        user.push_str("\nReviewer feedback:\n");
        for (i, note) in state.feedback.iter().enumerate() {
            user.push_str(&format!("  [{}] {}\n", i + 1, note));
        }
    }
    if let Some(previous) = state.draft.as_deref() {
        user.push_str(&format!("\nPrevious draft:\n{previous}\n"));
    }

    user.push('\n');
    user.push_str(&message_block(&state.message));

    request(StepName::Writer, system, user)
        .with_temperature(0.4)
        .with_max_tokens(WRITER_MAX_TOKENS)
}

pub fn parse_draft(raw: &str) -> Result<String, String> {
    let draft = raw.trim();
    if draft.is_empty() {
        return Err("writer returned an empty draft".into());
    }
    Ok(draft.to_string())
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
