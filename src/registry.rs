//! Static mapping between local cache keys and remote tables.
//!
//! Every table the engine knows about is a variant of [`Table`]. Its
//! per-table behavior (remote name, conflict target, field renames) lives in
//! a `&'static TableConfig`, so adding a table is a compile-time change.

use serde::{Deserialize, Serialize};

/// Column a remote upsert resolves conflicts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKey {
  /// One row per authenticated principal
  OwnerId,
  /// One row per record
  RecordId,
}

impl ConflictKey {
  /// Remote column name used as the `on_conflict` target.
  pub fn column(self) -> &'static str {
    match self {
      Self::OwnerId => "owner_id",
      Self::RecordId => "id",
    }
  }
}

/// Per-table configuration.
#[derive(Debug)]
pub struct TableConfig {
  pub remote: &'static str,
  /// Canonical local key first, then aliases that write to the same table
  pub local_keys: &'static [&'static str],
  pub conflict_key: ConflictKey,
  /// Table holds at most one row per owner
  pub singleton: bool,
  /// Local field name -> remote column name
  pub field_map: &'static [(&'static str, &'static str)],
}

impl TableConfig {
  /// The local key a pull writes into.
  pub fn canonical_key(&self) -> &'static str {
    self.local_keys[0]
  }
}

/// Remote tables the engine replicates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
  UserProfile,
  UserSettings,
  AnalyticsSnapshot,
  Post,
  PostDraft,
  Connection,
  CapturedApi,
}

static USER_PROFILE: TableConfig = TableConfig {
  remote: "user_profiles",
  local_keys: &["profile"],
  conflict_key: ConflictKey::OwnerId,
  singleton: true,
  field_map: &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("capturedAt", "captured_at"),
    ("fullName", "full_name"),
    ("profileUrl", "profile_url"),
    ("linkedinId", "linkedin_id"),
    ("avatarUrl", "avatar_url"),
    ("followerCount", "follower_count"),
    ("connectionCount", "connection_count"),
  ],
};

static USER_SETTINGS: TableConfig = TableConfig {
  remote: "user_settings",
  local_keys: &["settings"],
  conflict_key: ConflictKey::OwnerId,
  singleton: true,
  field_map: &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("capturedAt", "captured_at"),
    ("autoSync", "auto_sync"),
    ("syncInterval", "sync_interval"),
    ("notificationsEnabled", "notifications_enabled"),
  ],
};

static ANALYTICS_SNAPSHOT: TableConfig = TableConfig {
  remote: "analytics_snapshots",
  local_keys: &["analytics"],
  conflict_key: ConflictKey::RecordId,
  singleton: false,
  field_map: &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("capturedAt", "captured_at"),
    ("profileViews", "profile_views"),
    ("postImpressions", "post_impressions"),
    ("searchAppearances", "search_appearances"),
    ("snapshotDate", "snapshot_date"),
  ],
};

static POST: TableConfig = TableConfig {
  remote: "posts",
  local_keys: &["posts", "saved_posts"],
  conflict_key: ConflictKey::RecordId,
  singleton: false,
  field_map: &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("capturedAt", "captured_at"),
    ("postUrl", "post_url"),
    ("authorName", "author_name"),
    ("likeCount", "like_count"),
    ("commentCount", "comment_count"),
    ("publishedAt", "published_at"),
  ],
};

static POST_DRAFT: TableConfig = TableConfig {
  remote: "post_drafts",
  local_keys: &["drafts"],
  conflict_key: ConflictKey::RecordId,
  singleton: false,
  field_map: &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("capturedAt", "captured_at"),
    ("scheduledFor", "scheduled_for"),
    ("mediaUrls", "media_urls"),
  ],
};

static CONNECTION: TableConfig = TableConfig {
  remote: "connections",
  local_keys: &["connections"],
  conflict_key: ConflictKey::RecordId,
  singleton: false,
  field_map: &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("capturedAt", "captured_at"),
    ("fullName", "full_name"),
    ("profileUrl", "profile_url"),
    ("connectedAt", "connected_at"),
  ],
};

static CAPTURED_API: TableConfig = TableConfig {
  remote: "captured_apis",
  local_keys: &["captured_apis", "network_captures", "api_responses"],
  conflict_key: ConflictKey::RecordId,
  singleton: false,
  field_map: &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("capturedAt", "captured_at"),
    ("requestUrl", "request_url"),
    ("statusCode", "status_code"),
    ("responseBody", "response_body"),
    ("pageType", "page_type"),
  ],
};

impl Table {
  pub const ALL: [Table; 7] = [
    Table::UserProfile,
    Table::UserSettings,
    Table::AnalyticsSnapshot,
    Table::Post,
    Table::PostDraft,
    Table::Connection,
    Table::CapturedApi,
  ];

  pub fn config(self) -> &'static TableConfig {
    match self {
      Self::UserProfile => &USER_PROFILE,
      Self::UserSettings => &USER_SETTINGS,
      Self::AnalyticsSnapshot => &ANALYTICS_SNAPSHOT,
      Self::Post => &POST,
      Self::PostDraft => &POST_DRAFT,
      Self::Connection => &CONNECTION,
      Self::CapturedApi => &CAPTURED_API,
    }
  }

  /// Resolve the table a local cache key writes to, if any.
  pub fn for_local_key(key: &str) -> Option<Table> {
    Self::ALL
      .into_iter()
      .find(|table| table.config().local_keys.contains(&key))
  }

  /// Resolve a table from its remote name.
  pub fn from_remote(name: &str) -> Option<Table> {
    Self::ALL
      .into_iter()
      .find(|table| table.config().remote == name)
  }

  pub fn remote_name(self) -> &'static str {
    self.config().remote
  }

  pub fn canonical_key(self) -> &'static str {
    self.config().canonical_key()
  }

  pub fn conflict_key(self) -> ConflictKey {
    self.config().conflict_key
  }

  pub fn is_singleton(self) -> bool {
    self.config().singleton
  }

  pub fn field_map(self) -> &'static [(&'static str, &'static str)] {
    self.config().field_map
  }
}

impl std::fmt::Display for Table {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.remote_name())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const TIMESTAMP_FIELDS: &[(&str, &str)] = &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("capturedAt", "captured_at"),
  ];

  #[test]
  fn test_every_table_maps_timestamps() {
    for table in Table::ALL {
      for pair in TIMESTAMP_FIELDS {
        assert!(
          table.field_map().contains(pair),
          "{} is missing {:?}",
          table,
          pair
        );
      }
    }
  }

  #[test]
  fn test_local_key_lookup() {
    assert_eq!(Table::for_local_key("profile"), Some(Table::UserProfile));
    assert_eq!(Table::for_local_key("saved_posts"), Some(Table::Post));
    assert_eq!(Table::for_local_key("ui_theme"), None);
  }

  #[test]
  fn test_captured_apis_has_several_writers() {
    for key in ["captured_apis", "network_captures", "api_responses"] {
      assert_eq!(Table::for_local_key(key), Some(Table::CapturedApi));
    }
    assert_eq!(Table::CapturedApi.canonical_key(), "captured_apis");
  }

  #[test]
  fn test_remote_lookup_round_trips() {
    for table in Table::ALL {
      assert_eq!(Table::from_remote(table.remote_name()), Some(table));
      assert_eq!(Table::for_local_key(table.canonical_key()), Some(table));
    }
  }

  #[test]
  fn test_singletons_key_on_owner() {
    for table in Table::ALL {
      let expected = if table.is_singleton() {
        ConflictKey::OwnerId
      } else {
        ConflictKey::RecordId
      };
      assert_eq!(table.conflict_key(), expected);
    }
    assert_eq!(Table::UserProfile.conflict_key().column(), "owner_id");
    assert_eq!(Table::Post.conflict_key().column(), "id");
  }

  #[test]
  fn test_local_keys_are_unique() {
    let mut seen = std::collections::HashSet::new();
    for table in Table::ALL {
      for key in table.config().local_keys {
        assert!(seen.insert(*key), "{} mapped twice", key);
      }
    }
  }
}
