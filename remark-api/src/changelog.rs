use serde_json::{json, Value};

use crate::{CommentType, Error, NewComment, Target, UserId};

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(from = "String", into = "String")]
pub enum ChangelogAction {
    Created,
    Updated,
    Deleted,
    StatusChanged,
    Other(String),
}

impl From<String> for ChangelogAction {
    fn from(s: String) -> ChangelogAction {
        match &s as &str {
            "created" => ChangelogAction::Created,
            "updated" => ChangelogAction::Updated,
            "deleted" => ChangelogAction::Deleted,
            "status_changed" => ChangelogAction::StatusChanged,
            _ => ChangelogAction::Other(s),
        }
    }
}

impl From<ChangelogAction> for String {
    fn from(a: ChangelogAction) -> String {
        match a {
            ChangelogAction::Created => String::from("created"),
            ChangelogAction::Updated => String::from("updated"),
            ChangelogAction::Deleted => String::from("deleted"),
            ChangelogAction::StatusChanged => String::from("status_changed"),
            ChangelogAction::Other(s) => s,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChangelog {
    pub target_collection: String,
    #[serde(deserialize_with = "crate::payload::string_or_number")]
    pub target_id: String,
    pub action: ChangelogAction,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
}

fn show(v: &Option<Value>) -> String {
    match v {
        None | Some(Value::Null) => String::from("null"),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
    }
}

impl NewChangelog {
    pub fn target(&self) -> Target {
        Target::new(self.target_collection.clone(), self.target_id.clone())
    }

    /// Human-readable narration of the change, in markdown
    pub fn content(&self) -> String {
        match &self.action {
            ChangelogAction::Created => String::from("created this record"),
            ChangelogAction::Updated => match &self.field {
                Some(field) => format!(
                    "changed **{field}** from `{}` to `{}`",
                    show(&self.old_value),
                    show(&self.new_value)
                ),
                None => String::from("updated this record"),
            },
            ChangelogAction::Deleted => String::from("deleted this record"),
            ChangelogAction::StatusChanged => format!(
                "changed status from **{}** to **{}**",
                show(&self.old_value),
                show(&self.new_value)
            ),
            ChangelogAction::Other(action) => action.clone(),
        }
    }

    pub fn metadata(&self) -> Value {
        json!({
            "action": String::from(self.action.clone()),
            "field": self.field,
            "oldValue": self.old_value,
            "newValue": self.new_value,
        })
    }

    pub fn into_new_comment(self, author_id: Option<UserId>) -> Result<NewComment, Error> {
        let target = self.target();
        target.validate()?;
        if let Some(field) = &self.field {
            crate::validate_string(field)?;
        }
        let content = self.content();
        crate::validate_string(&content)?;
        let metadata = self.metadata();
        crate::validate_json(&metadata)?;
        Ok(NewComment {
            author_id,
            target,
            metadata: Some(metadata),
            content,
            parent_id: None,
            kind: CommentType::Changelog,
        })
    }
}
