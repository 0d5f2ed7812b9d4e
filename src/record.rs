//! Row model shared by the stores, the rebuild pipeline and the aggregator.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::PartialDataError;

/// Stable opaque identifier of one embedding row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RowKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Platform account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Archival,
    LiveUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ClaimStatus {
    Unclaimed,
    Claimed { by: UserId },
}

impl ClaimStatus {
    pub fn claimant(&self) -> Option<UserId> {
        match self {
            ClaimStatus::Unclaimed => None,
            ClaimStatus::Claimed { by } => Some(*by),
        }
    }
}

/// Display and derived labels attached to a face.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceMetadata {
    pub display_name: String,
    pub era: Option<String>,
    pub region: Option<String>,
}

/// One row as streamed out of a store for index building. The embedding is
/// still raw bytes; the rebuild pipeline validates it.
#[derive(Debug, Clone)]
pub struct RawEmbeddingRow {
    pub row_key: RowKey,
    pub source: SourceKind,
    pub owner_user_id: Option<UserId>,
    pub embedding: Vec<u8>,
}

/// Resolved identity behind an indexed row.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceIdentity {
    Archival {
        metadata: FaceMetadata,
        claim: ClaimStatus,
    },
    LiveUser {
        user_id: UserId,
        metadata: FaceMetadata,
    },
}

impl FaceIdentity {
    pub fn source(&self) -> SourceKind {
        match self {
            FaceIdentity::Archival { .. } => SourceKind::Archival,
            FaceIdentity::LiveUser { .. } => SourceKind::LiveUser,
        }
    }

    /// Account the face belongs to, either directly or through a claim.
    pub fn owner(&self) -> Option<UserId> {
        match self {
            FaceIdentity::Archival { claim, .. } => claim.claimant(),
            FaceIdentity::LiveUser { user_id, .. } => Some(*user_id),
        }
    }

    pub fn metadata(&self) -> &FaceMetadata {
        match self {
            FaceIdentity::Archival { metadata, .. } | FaceIdentity::LiveUser { metadata, .. } => {
                metadata
            }
        }
    }

    /// Key under which candidates for the same real-world person collapse.
    ///
    /// A claimed archival face and the claimant's live profile share
    /// `user:<id>`; everything else is keyed by its own row.
    pub fn dedup_key(&self, row_key: &RowKey) -> DedupKey {
        match self {
            FaceIdentity::Archival {
                claim: ClaimStatus::Claimed { by },
                ..
            } => DedupKey::User(*by),
            FaceIdentity::Archival {
                claim: ClaimStatus::Unclaimed,
                ..
            } => DedupKey::Face(row_key.clone()),
            FaceIdentity::LiveUser { user_id, .. } => DedupKey::User(*user_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    User(UserId),
    Face(RowKey),
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupKey::User(id) => write!(f, "user:{}", id),
            DedupKey::Face(key) => write!(f, "face:{}", key),
        }
    }
}

impl Serialize for DedupKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A stored face row. For archival rows `owner_user_id` is the claimant, for
/// live rows it is the account the profile embedding belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub row_key: RowKey,
    pub source: SourceKind,
    pub owner_user_id: Option<UserId>,
    #[serde(with = "serde_bytes")]
    pub embedding: Vec<u8>,
    pub metadata: FaceMetadata,
}

impl FaceRecord {
    pub fn archival(
        row_key: impl Into<RowKey>,
        embedding: Vec<u8>,
        metadata: FaceMetadata,
    ) -> Self {
        Self {
            row_key: row_key.into(),
            source: SourceKind::Archival,
            owner_user_id: None,
            embedding,
            metadata,
        }
    }

    pub fn live_user(
        row_key: impl Into<RowKey>,
        user_id: UserId,
        embedding: Vec<u8>,
        metadata: FaceMetadata,
    ) -> Self {
        Self {
            row_key: row_key.into(),
            source: SourceKind::LiveUser,
            owner_user_id: Some(user_id),
            embedding,
            metadata,
        }
    }

    pub fn claim_status(&self) -> ClaimStatus {
        match (self.source, self.owner_user_id) {
            (SourceKind::Archival, Some(by)) => ClaimStatus::Claimed { by },
            _ => ClaimStatus::Unclaimed,
        }
    }

    pub fn identity(&self) -> Result<FaceIdentity, PartialDataError> {
        match self.source {
            SourceKind::Archival => Ok(FaceIdentity::Archival {
                metadata: self.metadata.clone(),
                claim: self.claim_status(),
            }),
            SourceKind::LiveUser => match self.owner_user_id {
                Some(user_id) => Ok(FaceIdentity::LiveUser {
                    user_id,
                    metadata: self.metadata.clone(),
                }),
                None => Err(PartialDataError::new(
                    self.row_key.clone(),
                    "live user row has no owner",
                )),
            },
        }
    }

    pub fn raw_row(&self) -> RawEmbeddingRow {
        RawEmbeddingRow {
            row_key: self.row_key.clone(),
            source: self.source,
            owner_user_id: self.owner_user_id,
            embedding: self.embedding.clone(),
        }
    }
}
