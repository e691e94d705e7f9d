//! User Directory
//!
//! Mirrors identity-provider claims into the durable users table on
//! authentication. The user id is the provider's subject; when legacy
//! data holds the same email under a different id, the row is
//! reconciled once, explicitly, never silently ignored.

use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::VerifiedUser;
use crate::db::UserRepo;
use crate::error::{AuctionError, Result};
use crate::models::User;

pub struct UserDirectory {
    users: Arc<dyn UserRepo>,
}

impl UserDirectory {
    pub fn new(users: Arc<dyn UserRepo>) -> Self {
        Self { users }
    }

    /// Ensure a durable row exists for the verified identity and
    /// reflects its current claims. Returns the synced user.
    pub async fn sync(&self, identity: &VerifiedUser) -> Result<User> {
        if let Some(existing) = self.users.fetch(identity.user_id).await? {
            return self.apply_claims(existing, identity).await;
        }

        let email = identity.email.clone().ok_or_else(|| {
            AuctionError::Unauthorized("Token is missing an email claim".into())
        })?;

        // Same email under another id means legacy data; reconcile
        // before creating anything.
        if let Some(legacy) = self.users.fetch_by_email(&email).await? {
            if legacy.user_id != identity.user_id {
                return self.reconcile_legacy(legacy, identity).await;
            }
        }

        let user = Self::row_from_identity(identity, email);
        self.users.insert(&user).await?;
        info!(user_id = %user.user_id, "created user from identity claims");
        Ok(user)
    }

    async fn apply_claims(&self, mut user: User, identity: &VerifiedUser) -> Result<User> {
        let mut changed = false;

        if let Some(email) = &identity.email {
            if &user.email != email {
                user.email = email.clone();
                changed = true;
            }
        }
        if let Some(name) = &identity.name {
            if user.name.as_deref() != Some(name) {
                user.name = Some(name.clone());
                changed = true;
            }
        }
        if let Some(phone) = &identity.phone {
            if user.phone.as_deref() != Some(phone) {
                user.phone = Some(phone.clone());
                changed = true;
            }
        }
        if user.is_verified != identity.email_verified {
            user.is_verified = identity.email_verified;
            changed = true;
        }
        // Usernames are unique; only adopt the claim when free.
        if user.username != identity.username
            && !self
                .users
                .username_taken_by_other(&identity.username, user.user_id)
                .await?
        {
            user.username = identity.username.clone();
            changed = true;
        }

        if changed {
            self.users.update_profile(&user).await?;
            info!(user_id = %user.user_id, "updated user from identity claims");
        }
        Ok(user)
    }

    /// One-shot migration for a legacy row holding this email under a
    /// different id. Unreferenced rows are deleted and recreated;
    /// referenced rows are renamed in one transaction that repoints
    /// every auction reference.
    async fn reconcile_legacy(&self, legacy: User, identity: &VerifiedUser) -> Result<User> {
        let references = self.users.auction_reference_count(legacy.user_id).await?;
        let email = legacy.email.clone();
        let user = Self::row_from_identity(identity, email);

        if references == 0 {
            warn!(
                legacy_id = %legacy.user_id,
                new_id = %identity.user_id,
                "deleting unreferenced legacy user row and recreating"
            );
            self.users.delete(legacy.user_id).await?;
            self.users.insert(&user).await?;
        } else {
            warn!(
                legacy_id = %legacy.user_id,
                new_id = %identity.user_id,
                references,
                "migrating legacy user id across auction references"
            );
            self.users.migrate_identity(legacy.user_id, &user).await?;
        }
        Ok(user)
    }

    fn row_from_identity(identity: &VerifiedUser, email: String) -> User {
        User {
            user_id: identity.user_id,
            email,
            username: identity.username.clone(),
            name: identity.name.clone(),
            phone: identity.phone.clone(),
            is_verified: identity.email_verified,
            created_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AuctionRepo, MemoryAuctionRepo, MemoryUserRepo};
    use crate::models::{Auction, AuctionStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn identity(email: &str, username: &str) -> VerifiedUser {
        VerifiedUser {
            user_id: Uuid::new_v4(),
            username: username.into(),
            email: Some(email.into()),
            email_verified: true,
            name: Some("Someone".into()),
            phone: None,
        }
    }

    fn legacy_user(email: &str, username: &str) -> User {
        User {
            user_id: Uuid::new_v4(),
            email: email.into(),
            username: username.into(),
            name: None,
            phone: None,
            is_verified: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_sync_creates_the_user() {
        let repo = MemoryUserRepo::new();
        let directory = UserDirectory::new(Arc::new(repo.clone()));
        let identity = identity("alice@example.com", "alice");

        let user = directory.sync(&identity).await.unwrap();
        assert_eq!(user.user_id, identity.user_id);
        assert_eq!(user.email, "alice@example.com");
        assert!(repo.fetch(identity.user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn repeat_sync_applies_fresh_claims() {
        let repo = MemoryUserRepo::new();
        let directory = UserDirectory::new(Arc::new(repo.clone()));
        let mut identity = identity("alice@example.com", "alice");

        directory.sync(&identity).await.unwrap();
        identity.name = Some("Alice A.".into());
        identity.phone = Some("+15550100".into());

        let user = directory.sync(&identity).await.unwrap();
        assert_eq!(user.name.as_deref(), Some("Alice A."));
        assert_eq!(user.phone.as_deref(), Some("+15550100"));
    }

    #[tokio::test]
    async fn username_claim_is_skipped_when_taken() {
        let repo = MemoryUserRepo::with([legacy_user("bob@example.com", "wanted")]);
        let directory = UserDirectory::new(Arc::new(repo.clone()));

        let mut identity = identity("alice@example.com", "alice");
        directory.sync(&identity).await.unwrap();
        identity.username = "wanted".into();

        let user = directory.sync(&identity).await.unwrap();
        assert_eq!(user.username, "alice");
    }

    #[tokio::test]
    async fn unreferenced_legacy_row_is_deleted_and_recreated() {
        let legacy = legacy_user("alice@example.com", "alice-legacy");
        let legacy_id = legacy.user_id;
        let repo = MemoryUserRepo::with([legacy]);
        let directory = UserDirectory::new(Arc::new(repo.clone()));

        let identity = identity("alice@example.com", "alice");
        let user = directory.sync(&identity).await.unwrap();

        assert_eq!(user.user_id, identity.user_id);
        assert!(repo.fetch(legacy_id).await.unwrap().is_none());
        assert!(repo.fetch(identity.user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn referenced_legacy_row_is_migrated_with_its_auctions() {
        let legacy = legacy_user("alice@example.com", "alice-legacy");
        let legacy_id = legacy.user_id;

        let auctions = MemoryAuctionRepo::new();
        let auction = Auction {
            auction_id: Uuid::new_v4(),
            host_user_id: legacy_id,
            title: "Lot".into(),
            description: None,
            category: None,
            duration_seconds: 60,
            starting_bid: dec!(10),
            status: AuctionStatus::Live,
            seller_name: "Seller".into(),
            condition: None,
            image_url: None,
            gallery_urls: vec![],
            stream_channel_id: None,
            stream_playback_url: None,
            winner_id: Some(legacy_id),
            winning_bid: None,
            created_at: Utc::now(),
            ended_at: None,
        };
        auctions.insert(&auction).await.unwrap();
        let repo = MemoryUserRepo::with([legacy]).linked_to(&auctions);
        let directory = UserDirectory::new(Arc::new(repo.clone()));

        let identity = identity("alice@example.com", "alice");
        let user = directory.sync(&identity).await.unwrap();
        assert_eq!(user.user_id, identity.user_id);

        let migrated = auctions.fetch(auction.auction_id).await.unwrap().unwrap();
        assert_eq!(migrated.host_user_id, identity.user_id);
        assert_eq!(migrated.winner_id, Some(identity.user_id));
        assert!(repo.fetch(legacy_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_email_claim_cannot_create_a_user() {
        let directory = UserDirectory::new(Arc::new(MemoryUserRepo::new()));
        let mut identity = identity("x@example.com", "x");
        identity.email = None;
        assert!(matches!(
            directory.sync(&identity).await.unwrap_err(),
            AuctionError::Unauthorized(_)
        ));
    }
}
