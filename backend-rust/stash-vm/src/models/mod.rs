use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User is an account that owns things, lists and images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    /// When set, the purge worker deletes the account once this moment has passed.
    pub purge_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public profile of a user. The image is a non-owning reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub full_name: String,
    pub information: String,
    pub image_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Thing is an inventory item owned by exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thing {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    /// Only ever populated for the owner.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private_note: Option<String>,
    /// Sum of the quantity ledger.
    pub quantity: i64,
    pub quantity_unit: String,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thing {
    /// Strip owner-only fields when the thing is shown to someone else.
    pub fn redacted_for(mut self, viewer_id: &str) -> Self {
        if self.owner_id != viewer_id {
            self.private_note = None;
        }
        self
    }
}

/// One append-only entry of a thing's quantity ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantityEntry {
    pub id: String,
    pub thing_id: String,
    pub delta: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Property {
    pub name: String,
    #[serde(flatten)]
    pub value: PropertyValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyValue {
    String { value: String },
    Float {
        value: f64,
        #[serde(default)]
        unit: String,
    },
    Datetime { value: DateTime<Utc> },
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String { .. } => "string",
            PropertyValue::Float { .. } => "float",
            PropertyValue::Datetime { .. } => "datetime",
        }
    }
}

/// Default visibility of a list to the owner's social graph.
///
/// Variants are declared from the narrowest to the widest audience, so the
/// derived ordering compares tiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum SharingState {
    #[default]
    Private,
    Friends,
    FriendsOfFriends,
}

impl SharingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharingState::Private => "private",
            SharingState::Friends => "friends",
            SharingState::FriendsOfFriends => "friends_of_friends",
        }
    }
}

impl fmt::Display for SharingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SharingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(SharingState::Private),
            "friends" => Ok(SharingState::Friends),
            "friends_of_friends" => Ok(SharingState::FriendsOfFriends),
            other => Err(format!("unknown sharing state '{}'", other)),
        }
    }
}

/// List is a named collection of the owner's things.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct List {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub sharing_state: SharingState,
    #[serde(default)]
    pub thing_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A list together with the things in it, as seen by one viewer.
#[derive(Debug, Clone, Serialize)]
pub struct ListWithThings {
    #[serde(flatten)]
    pub list: List,
    pub things: Vec<Thing>,
}

/// Image metadata. The bytes live in the content store under `hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub mime: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// The object a share grants access to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ShareTarget {
    Thing(String),
    List(String),
}

impl ShareTarget {
    pub fn id(&self) -> &str {
        match self {
            ShareTarget::Thing(id) | ShareTarget::List(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ShareTarget::Thing(_) => "Thing",
            ShareTarget::List(_) => "List",
        }
    }
}

/// A directed read grant from the owner of an object to one other user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub id: String,
    pub owner_id: String,
    pub target_user_id: String,
    pub target: ShareTarget,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestState {
    Pending,
    Accepted,
    Rejected,
}

impl FriendRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendRequestState::Pending => "pending",
            FriendRequestState::Accepted => "accepted",
            FriendRequestState::Rejected => "rejected",
        }
    }
}

impl FromStr for FriendRequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FriendRequestState::Pending),
            "accepted" => Ok(FriendRequestState::Accepted),
            "rejected" => Ok(FriendRequestState::Rejected),
            other => Err(format!("unknown friend request state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub state: FriendRequestState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// FriendRequests split by direction for one user.
#[derive(Debug, Clone, Serialize)]
pub struct FriendRequests {
    pub sent: Vec<FriendRequest>,
    pub received: Vec<FriendRequest>,
}

/// Friendship is symmetric; the pair is stored with `friend1_id < friend2_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friendship {
    pub friend1_id: String,
    pub friend2_id: String,
    pub friend_request_id: String,
    pub created_at: DateTime<Utc>,
}

impl Friendship {
    pub fn other(&self, user_id: &str) -> &str {
        if self.friend1_id == user_id {
            &self.friend2_id
        } else {
            &self.friend1_id
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartEntry {
    pub user_id: String,
    pub thing_id: String,
    pub created_at: DateTime<Utc>,
}

/// Payload of a notification. The tag doubles as the stored content type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "content_type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationContent {
    FriendRequest {
        request_id: String,
        sender_id: String,
    },
    FriendRequestReaction {
        request_id: String,
        sender_id: String,
        receiver_id: String,
        accepted: bool,
    },
    ThingShared {
        share_id: String,
        thing_id: String,
        sharer_id: String,
    },
    ListShared {
        share_id: String,
        list_id: String,
        sharer_id: String,
    },
    ThingsAddedToList {
        list_id: String,
        thing_ids: Vec<String>,
        sharer_id: String,
    },
    ListSharingChanged {
        list_id: String,
        owner_id: String,
        sharing_state: SharingState,
    },
    AccountDeletionScheduled {
        purge_at: DateTime<Utc>,
    },
}

impl NotificationContent {
    pub fn content_type(&self) -> &'static str {
        match self {
            NotificationContent::FriendRequest { .. } => "FRIEND_REQUEST",
            NotificationContent::FriendRequestReaction { .. } => "FRIEND_REQUEST_REACTION",
            NotificationContent::ThingShared { .. } => "THING_SHARED",
            NotificationContent::ListShared { .. } => "LIST_SHARED",
            NotificationContent::ThingsAddedToList { .. } => "THINGS_ADDED_TO_LIST",
            NotificationContent::ListSharingChanged { .. } => "LIST_SHARING_CHANGED",
            NotificationContent::AccountDeletionScheduled { .. } => "ACCOUNT_DELETION_SCHEDULED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    /// User whose action produced the notification, if any.
    pub actor_id: Option<String>,
    #[serde(flatten)]
    pub content: NotificationContent,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Entry of the profile directory: a user's name next to their profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub user_id: String,
    pub name: String,
    pub full_name: String,
    pub information: String,
    pub image_id: Option<String>,
}

/// Things and lists visible to the searcher that match a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    pub things: Vec<Thing>,
    pub lists: Vec<List>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionType {
    Name,
    Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyCompletion {
    pub completion_type: CompletionType,
    pub values: Vec<String>,
}

// Request/Response types for API

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub invite_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// Users confirm their own deletion with their password.
#[derive(Debug, Deserialize)]
pub struct RequestDeletionRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub invite_required: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub information: String,
    pub image_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateThingRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub private_note: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub quantity_unit: String,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub image_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateThingRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub private_note: Option<String>,
    pub quantity: Option<i64>,
    pub quantity_unit: Option<String>,
    pub properties: Option<Vec<Property>>,
    pub image_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateListRequest {
    pub name: String,
    #[serde(default)]
    pub sharing_state: SharingState,
    #[serde(default)]
    pub thing_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateListRequest {
    pub name: Option<String>,
    pub sharing_state: Option<SharingState>,
    pub thing_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateShareRequest {
    pub target_user_id: String,
    pub target: ShareTarget,
}

#[derive(Debug, Deserialize)]
pub struct CreateFriendRequestRequest {
    pub receiver_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCartRequest {
    pub thing_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SchedulePurgeRequest {
    #[serde(default)]
    pub delay_minutes: i64,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharing_state_tiers_are_ordered() {
        assert!(SharingState::Private < SharingState::Friends);
        assert!(SharingState::Friends < SharingState::FriendsOfFriends);
        assert_eq!(
            "friends_of_friends".parse::<SharingState>().unwrap(),
            SharingState::FriendsOfFriends
        );
        assert!("public".parse::<SharingState>().is_err());
    }

    #[test]
    fn test_share_target_json_shape() {
        let target = ShareTarget::List("l1".to_string());
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "list", "id": "l1" }));
        assert_eq!(target.id(), "l1");
    }

    #[test]
    fn test_notification_content_tag_matches_content_type() {
        let content = NotificationContent::ThingsAddedToList {
            list_id: "l1".to_string(),
            thing_ids: vec!["t1".to_string()],
            sharer_id: "u1".to_string(),
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["content_type"], content.content_type());
        assert_eq!(json["content"]["list_id"], "l1");
    }

    #[test]
    fn test_redacted_thing_hides_private_note() {
        let now = Utc::now();
        let thing = Thing {
            id: "t1".to_string(),
            owner_id: "alice".to_string(),
            name: "Drill".to_string(),
            description: String::new(),
            private_note: Some("in the garage".to_string()),
            quantity: 1,
            quantity_unit: String::new(),
            properties: Vec::new(),
            image_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        assert!(thing.clone().redacted_for("alice").private_note.is_some());
        assert!(thing.redacted_for("bob").private_note.is_none());
    }
}
