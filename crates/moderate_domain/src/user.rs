use serde::{Deserialize, Serialize};

/// Authenticated user profile as returned by `GET /api/v2/user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: u64,
	pub username: String,
	pub slug: String,
	#[serde(default)]
	pub profile_pic: Option<String>,
	#[serde(default)]
	pub verified: Option<bool>,
	#[serde(default)]
	pub followers_count: Option<u64>,
	#[serde(default)]
	pub bio: Option<String>,
	#[serde(default)]
	pub country: Option<String>,
}
