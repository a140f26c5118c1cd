use serde::{
  Deserialize,
  Deserializer,
  Serialize
};
use uuid::Uuid;

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct UserDto {
  pub user_id:    Uuid,
  pub email:      String,
  #[serde(default)]
  pub username:   String,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub updated_at: String,
  #[serde(default = "default_true")]
  pub is_active:  bool
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct LoginRequest {
  pub email:    String,
  pub password: String
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct RegisterRequest {
  pub email:    String,
  pub password: String,
  pub username: String
}

/// Login and registration reply. Some
/// backends name the credential
/// `access_token` instead of `token`.
#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  Default,
)]
pub struct AuthResponse {
  #[serde(default)]
  pub user:         Option<UserDto>,
  #[serde(default)]
  pub token:        Option<String>,
  #[serde(default)]
  pub access_token: Option<String>
}

impl AuthResponse {
  pub fn bearer_token(
    &self
  ) -> Option<&str> {
    self
      .token
      .as_deref()
      .or(self.access_token.as_deref())
      .filter(|token| {
        !token.trim().is_empty()
      })
  }
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TokenVerification {
  #[serde(default)]
  pub valid: bool
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  Default,
)]
pub struct ProfileUpdate {
  #[serde(
    skip_serializing_if = "Option::is_none"
  )]
  pub email:    Option<String>,
  #[serde(
    skip_serializing_if = "Option::is_none"
  )]
  pub username: Option<String>
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TaskDto {
  pub task_id:      Uuid,
  pub user_id:      Uuid,
  pub title:        String,
  #[serde(
    default,
    deserialize_with = "null_as_empty"
  )]
  pub description:  String,
  #[serde(default)]
  pub is_completed: bool,
  #[serde(default)]
  pub created_at:   String,
  #[serde(default)]
  pub updated_at:   String,
  #[serde(default)]
  pub completed_at: Option<String>
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TaskCreate {
  pub title:       String,
  pub description: String
}

/// Partial task update. Only fields
/// that are `Some` go on the wire.
#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  Default,
  PartialEq,
  Eq,
)]
pub struct TaskPatch {
  #[serde(
    skip_serializing_if = "Option::is_none"
  )]
  pub title:        Option<String>,
  #[serde(
    skip_serializing_if = "Option::is_none"
  )]
  pub description:  Option<String>,
  #[serde(
    skip_serializing_if = "Option::is_none"
  )]
  pub is_completed: Option<bool>
}

impl TaskPatch {
  pub fn is_empty(&self) -> bool {
    self.title.is_none()
      && self.description.is_none()
      && self.is_completed.is_none()
  }

  pub fn apply_to(
    &self,
    task: &mut TaskDto
  ) {
    if let Some(title) = &self.title {
      task.title = title.clone();
    }
    if let Some(description) =
      &self.description
    {
      task.description =
        description.clone();
    }
    if let Some(done) =
      self.is_completed
    {
      task.is_completed = done;
    }
  }
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct ConversationDto {
  pub id:            i64,
  #[serde(default)]
  pub created_at:    String,
  #[serde(default)]
  pub updated_at:    String,
  #[serde(default)]
  pub last_activity: String
}

#[derive(
  Debug,
  Clone,
  Copy,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
  User,
  Assistant
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct MessageDto {
  pub id:        serde_json::Value,
  #[serde(alias = "sender_type")]
  pub role:      MessageRole,
  #[serde(default)]
  pub content:   String,
  #[serde(default)]
  pub timestamp: String
}

#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct ChatRequest {
  pub message:         String,
  #[serde(
    skip_serializing_if = "Option::is_none"
  )]
  pub conversation_id: Option<i64>
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
)]
pub struct ToolCallDto {
  pub name:      String,
  #[serde(default)]
  pub arguments: serde_json::Value,
  #[serde(default)]
  pub result:    serde_json::Value
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
)]
pub struct ChatReply {
  #[serde(default)]
  pub response:        String,
  #[serde(default)]
  pub conversation_id: Option<i64>,
  #[serde(
    default,
    deserialize_with = "null_as_empty"
  )]
  pub tool_calls:      Vec<ToolCallDto>
}

fn default_true() -> bool {
  true
}

fn null_as_empty<'de, D, T>(
  deserializer: D
) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de> + Default
{
  Ok(
    Option::<T>::deserialize(
      deserializer
    )?
    .unwrap_or_default()
  )
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::{
    AuthResponse,
    ChatReply,
    MessageDto,
    MessageRole,
    TaskDto,
    TaskPatch
  };

  #[test]
  fn task_with_null_description_reads_as_empty()
   {
    let task: TaskDto =
      serde_json::from_value(json!({
        "task_id": "7b0c34f4-5f0e-4a8e-a0a4-2f8d8f0b6f01",
        "user_id": "1d3c0c39-7d2b-4c2e-9b41-18a1d3f2c9aa",
        "title": "Buy milk",
        "description": null,
        "is_completed": false,
        "created_at": "2026-01-02T10:00:00Z",
        "updated_at": "2026-01-02T10:00:00Z",
        "completed_at": null
      }))
      .expect("decode task");
    assert_eq!(task.description, "");
    assert!(task.completed_at.is_none());
  }

  #[test]
  fn patch_serializes_only_present_fields()
   {
    let patch = TaskPatch {
      is_completed: Some(true),
      ..TaskPatch::default()
    };
    let value = serde_json::to_value(
      &patch
    )
    .expect("encode patch");
    assert_eq!(
      value,
      json!({ "is_completed": true })
    );
    assert!(TaskPatch::default().is_empty());
  }

  #[test]
  fn auth_response_falls_back_to_access_token()
   {
    let reply: AuthResponse =
      serde_json::from_value(json!({
        "access_token": "abc"
      }))
      .expect("decode reply");
    assert_eq!(
      reply.bearer_token(),
      Some("abc")
    );

    let empty: AuthResponse =
      serde_json::from_value(json!({
        "token": "  "
      }))
      .expect("decode reply");
    assert_eq!(empty.bearer_token(), None);
  }

  #[test]
  fn message_accepts_sender_type_alias() {
    let message: MessageDto =
      serde_json::from_value(json!({
        "id": 4,
        "sender_type": "assistant",
        "content": "hi",
        "timestamp": "2026-01-02T10:00:00"
      }))
      .expect("decode message");
    assert_eq!(
      message.role,
      MessageRole::Assistant
    );
  }

  #[test]
  fn chat_reply_tolerates_missing_tool_calls()
   {
    let reply: ChatReply =
      serde_json::from_value(json!({
        "response": "done",
        "conversation_id": 9,
        "tool_calls": null
      }))
      .expect("decode reply");
    assert!(reply.tool_calls.is_empty());
    assert_eq!(
      reply.conversation_id,
      Some(9)
    );
  }
}
