//! Live chat entry point and conversation management

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::{next_timestamp, AgentError, Orchestrator};
use crate::models::{now_millis, Conversation, Message, Role};
use crate::storage::{Store, StoreError};
use crate::tools::RegistryFactory;

const TITLE_MAX_CHARS: usize = 50;
/// Listing endpoints return at most this many conversations
const LIST_LIMIT: i64 = 100;
/// Upper bound on messages loaded for a full conversation view or export
const FULL_HISTORY_LIMIT: i64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: Option<String>,
    pub user_name: Option<String>,
    pub project_name: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub conversation_id: String,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "markdown",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "json" => Ok(ExportFormat::Json),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            _ => anyhow::bail!("Unknown export format: {}", s),
        }
    }
}

/// Title for a new conversation: the first message, cut to 47 chars plus "..." when long
pub fn conversation_title(first_message: &str) -> String {
    if first_message.chars().count() <= TITLE_MAX_CHARS {
        return first_message.to_string();
    }
    let head: String = first_message.chars().take(TITLE_MAX_CHARS - 3).collect();
    format!("{}...", head)
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    registry_factory: RegistryFactory,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<Orchestrator>,
        registry_factory: RegistryFactory,
    ) -> Self {
        Self {
            store,
            orchestrator,
            registry_factory,
        }
    }

    /// Persist the user's message, run the agent and return its final reply
    pub async fn send_message(&self, request: SendMessageRequest) -> Result<ChatReply, ChatError> {
        if request.message.trim().is_empty() {
            return Err(ChatError::InvalidRequest("message must not be empty".into()));
        }
        if request.project_name.trim().is_empty() {
            return Err(ChatError::InvalidRequest("projectName must not be empty".into()));
        }

        let (conversation, last_timestamp) = match request.conversation_id.as_deref() {
            Some(id) if !id.is_empty() => {
                let conversation = self
                    .store
                    .find_conversation(id)?
                    .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
                let last = self.store.list_messages(id, 1)?.last().map(|m| m.timestamp);
                (conversation, last)
            }
            _ => {
                let conversation = Conversation::new(
                    request.user_name.clone(),
                    request.project_name.clone(),
                    conversation_title(&request.message),
                    now_millis(),
                );
                self.store.create_conversation(&conversation)?;
                info!(
                    "Created conversation {} for project {}",
                    conversation.id, conversation.project_name
                );
                (conversation, None)
            }
        };

        let user_message = Message::user(
            &conversation.id,
            request.message,
            next_timestamp(last_timestamp),
        );
        self.store.create_message(&user_message)?;
        debug!("Stored user message {} in {}", user_message.id, conversation.id);

        let registry = (self.registry_factory)();
        let message = self.orchestrator.run(&conversation, &registry).await?;

        Ok(ChatReply {
            conversation_id: conversation.id,
            message,
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<ConversationDetail, ChatError> {
        let conversation = self
            .store
            .find_conversation(id)?
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
        let messages = self.store.list_messages(id, FULL_HISTORY_LIMIT)?;
        Ok(ConversationDetail {
            conversation,
            messages,
        })
    }

    /// Most recent conversations for a user, else for a project. Empty without a filter.
    pub fn list_conversations(
        &self,
        user_name: Option<&str>,
        project_name: Option<&str>,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations = match (user_name, project_name) {
            (Some(user), _) if !user.is_empty() => {
                self.store.list_conversations_by_user(user, LIST_LIMIT)?
            }
            (_, Some(project)) if !project.is_empty() => {
                self.store.list_conversations_by_project(project, LIST_LIMIT)?
            }
            _ => Vec::new(),
        };

        conversations
            .into_iter()
            .map(|conversation| {
                let message_count = self.store.count_messages(&conversation.id)?;
                Ok(ConversationSummary {
                    conversation,
                    message_count,
                })
            })
            .collect()
    }

    pub fn delete_conversation(&self, id: &str) -> Result<(), ChatError> {
        if !self.store.delete_conversation(id)? {
            return Err(ChatError::ConversationNotFound(id.to_string()));
        }
        info!("Deleted conversation {}", id);
        Ok(())
    }

    /// Export as a JSON document or a Markdown transcript
    pub fn export_conversation(&self, id: &str, format: ExportFormat) -> Result<Value, ChatError> {
        let detail = self.get_conversation(id)?;
        Ok(match format {
            ExportFormat::Json => {
                serde_json::to_value(&detail).map_err(StoreError::Serialization)?
            }
            ExportFormat::Markdown => Value::String(render_markdown(&detail)),
        })
    }
}

fn render_markdown(detail: &ConversationDetail) -> String {
    let conversation = &detail.conversation;
    let mut md = String::new();

    let _ = writeln!(md, "# {}\n", conversation.title);
    let _ = writeln!(md, "**Project:** {}", conversation.project_name);
    if let Some(user) = &conversation.user_name {
        let _ = writeln!(md, "**User:** {}", user);
    }
    if let Some(created) = Utc.timestamp_millis_opt(conversation.created_at).single() {
        let _ = writeln!(md, "**Created:** {}", created.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    md.push_str("\n---\n\n");

    // Tool-result carriers have no text of their own
    for message in detail.messages.iter().filter(|m| m.content.is_some()) {
        match message.role {
            Role::User => md.push_str("## User\n\n"),
            Role::Assistant => {
                md.push_str("## Assistant\n\n");
                if let (Some(input), Some(output)) = (message.input_tokens, message.output_tokens) {
                    let _ = writeln!(md, "*Tokens: {} in / {} out*\n", input, output);
                }
            }
        }
        let _ = writeln!(md, "{}\n", message.text());
        md.push_str("---\n\n");
    }

    md
}

/// JSON body for a chat reply, as returned by the HTTP API
pub fn reply_body(reply: &ChatReply) -> Value {
    let message = &reply.message;
    let mut body = json!({
        "success": true,
        "conversationId": reply.conversation_id,
        "messageId": message.id,
        "content": message.text(),
        "inputTokens": message.input_tokens.unwrap_or(0),
        "outputTokens": message.output_tokens.unwrap_or(0),
    });
    if !message.tool_calls.is_empty() {
        body["toolCalls"] = json!(message.tool_calls);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::storage::MemoryStore;
    use crate::testing::{call, text_reply, tool_reply, ScriptedLlm, StaticTool};
    use crate::tools::ToolRegistry;

    fn service(llm: Arc<ScriptedLlm>) -> (ChatService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            llm,
            store.clone(),
            AgentConfig::default(),
        ));
        let factory: RegistryFactory = Arc::new(|| {
            let mut registry = ToolRegistry::new();
            registry.register(Arc::new(StaticTool::new("read_tag", "42")));
            registry
        });
        (ChatService::new(store.clone(), orchestrator, factory), store)
    }

    fn request(conversation_id: Option<String>, message: &str) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id,
            user_name: Some("ana".into()),
            project_name: "plant".into(),
            message: message.into(),
        }
    }

    #[test]
    fn test_conversation_title() {
        assert_eq!(conversation_title("Short question"), "Short question");

        let exact = "x".repeat(50);
        assert_eq!(conversation_title(&exact), exact);

        let long = "y".repeat(51);
        let title = conversation_title(&long);
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));
        assert_eq!(&title[..47], &long[..47]);
    }

    #[test]
    fn test_export_format_parse() {
        assert_eq!("".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("Markdown".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert!("pdf".parse::<ExportFormat>().is_err());
    }

    #[tokio::test]
    async fn test_send_message_creates_then_continues() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            text_reply("Hello"),
            tool_reply("", vec![call("t1", "read_tag")]),
            text_reply("The tag reads 42"),
        ]));
        let (chat, store) = service(llm.clone());

        let first = chat
            .send_message(request(None, "What does the pump tag read right now?"))
            .await
            .unwrap();
        assert_eq!(first.message.text(), "Hello");

        let conv = store.find_conversation(&first.conversation_id).unwrap().unwrap();
        assert_eq!(conv.title, "What does the pump tag read right now?");
        assert_eq!(conv.user_name.as_deref(), Some("ana"));

        let second = chat
            .send_message(request(Some(first.conversation_id.clone()), "And now?"))
            .await
            .unwrap();
        assert_eq!(second.conversation_id, first.conversation_id);
        assert_eq!(second.message.text(), "The tag reads 42");
        assert_eq!(second.message.tool_calls.len(), 1);

        let messages = store.list_messages(&first.conversation_id, 100).unwrap();
        let texts: Vec<&str> = messages.iter().map(|m| m.text()).collect();
        assert_eq!(
            texts,
            vec!["What does the pump tag read right now?", "Hello", "And now?", "The tag reads 42"]
        );
        assert!(messages.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        // Second call saw the earlier exchange
        assert_eq!(llm.requests()[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_send_message_errors() {
        let (chat, store) = service(Arc::new(ScriptedLlm::default()));

        let err = chat
            .send_message(request(Some("missing".into()), "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(_)));

        let err = chat.send_message(request(None, "  ")).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));

        // Provider failure: user message kept, nothing else
        let err = chat.send_message(request(None, "hi")).await.unwrap_err();
        assert!(matches!(err, ChatError::Agent(AgentError::Provider(_))));
        let convs = store.list_conversations_by_user("ana", 10).unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(store.count_messages(&convs[0].id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_get_delete_export() {
        let llm = Arc::new(ScriptedLlm::new(vec![text_reply("Pump is running")]));
        let (chat, _store) = service(llm);

        let reply = chat.send_message(request(None, "Pump status?")).await.unwrap();
        let id = reply.conversation_id.clone();

        let listed = chat.list_conversations(Some("ana"), None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message_count, 2);
        assert_eq!(chat.list_conversations(None, Some("plant")).unwrap().len(), 1);
        assert!(chat.list_conversations(None, None).unwrap().is_empty());

        let detail = chat.get_conversation(&id).unwrap();
        assert_eq!(detail.messages.len(), 2);

        let json = chat.export_conversation(&id, ExportFormat::Json).unwrap();
        assert_eq!(json["title"], "Pump status?");
        assert_eq!(json["messages"][1]["content"], "Pump is running");

        let md = chat.export_conversation(&id, ExportFormat::Markdown).unwrap();
        let md = md.as_str().unwrap();
        assert!(md.starts_with("# Pump status?\n"));
        assert!(md.contains("**User:** ana"));
        assert!(md.contains("## Assistant\n\n*Tokens: 10 in / 5 out*"));

        let body = reply_body(&reply);
        assert_eq!(body["success"], true);
        assert_eq!(body["content"], "Pump is running");
        assert!(body.get("toolCalls").is_none());

        chat.delete_conversation(&id).unwrap();
        assert!(matches!(
            chat.delete_conversation(&id),
            Err(ChatError::ConversationNotFound(_))
        ));
        assert!(matches!(
            chat.get_conversation(&id),
            Err(ChatError::ConversationNotFound(_))
        ));
    }
}
