use crate::config::PhotoLimits;
use crate::ports::Services;
use crate::session::{ConversationSession, PhotoRecord};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotoIntake {
    /// Media id already recorded; nothing changes.
    Duplicate,
    /// The cap is reached; the photo was not recorded.
    AtLimit,
    Added { count: usize },
}

/// What, if anything, to tell the seller after an intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoNotice {
    Progress { count: usize },
    Ready { count: usize },
}

/// Records an inbound photo. When a catalog draft already exists the photo is
/// uploaded right away; a failed upload stays pending for the submission step.
pub async fn accept_photo(
    services: &Services,
    session: &mut ConversationSession,
    media_id: &str,
    limits: PhotoLimits,
) -> PhotoIntake {
    if session.has_photo(media_id) {
        debug!(target = "closet.conversation", media_id, "duplicate_photo_ignored");
        return PhotoIntake::Duplicate;
    }
    if session.photos.len() >= limits.max {
        return PhotoIntake::AtLimit;
    }

    let mut record = PhotoRecord::pending(media_id);
    if let Some(draft_id) = session.external_draft_id.clone() {
        match upload(services, &draft_id, media_id).await {
            Ok(stored) => {
                record.stored_asset_id = Some(stored.asset_id);
                record.stored_url = stored.url;
                record.uploaded = true;
            }
            Err(err) => {
                warn!(target = "closet.conversation", media_id, error = %err, "photo_upload_deferred");
            }
        }
    }
    session.append_photo(record);
    PhotoIntake::Added {
        count: session.photos.len(),
    }
}

pub(crate) async fn upload(
    services: &Services,
    draft_id: &str,
    media_id: &str,
) -> Result<crate::ports::StoredPhoto, crate::ports::ServiceError> {
    let asset = services.media.fetch(media_id).await?;
    services.catalog.attach_photo(draft_id, &asset).await
}

/// Notification policy. Below the minimum every count change is reported;
/// crossing the minimum offers submission once; beyond that stays quiet.
/// A count that was already reported is never reported again.
pub fn notice_for(count: usize, last_notified: usize, min: usize) -> Option<PhotoNotice> {
    if count == last_notified {
        return None;
    }
    if count < min {
        Some(PhotoNotice::Progress { count })
    } else if last_notified < min {
        Some(PhotoNotice::Ready { count })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    #[test]
    fn notices_below_at_and_above_minimum() {
        assert_eq!(notice_for(1, 0, 3), Some(PhotoNotice::Progress { count: 1 }));
        assert_eq!(notice_for(2, 1, 3), Some(PhotoNotice::Progress { count: 2 }));
        assert_eq!(notice_for(3, 2, 3), Some(PhotoNotice::Ready { count: 3 }));
        assert_eq!(notice_for(4, 3, 3), None);
        assert_eq!(notice_for(3, 3, 3), None);
    }

    #[tokio::test]
    async fn duplicates_and_cap_are_not_recorded() {
        let harness = TestHarness::new();
        let services = harness.services();
        let limits = PhotoLimits { min: 1, max: 2 };
        let mut session = ConversationSession::new("15550100000");

        assert_eq!(
            accept_photo(&services, &mut session, "m1", limits).await,
            PhotoIntake::Added { count: 1 }
        );
        assert_eq!(
            accept_photo(&services, &mut session, "m1", limits).await,
            PhotoIntake::Duplicate
        );
        assert_eq!(
            accept_photo(&services, &mut session, "m2", limits).await,
            PhotoIntake::Added { count: 2 }
        );
        assert_eq!(
            accept_photo(&services, &mut session, "m3", limits).await,
            PhotoIntake::AtLimit
        );
        assert_eq!(session.photos.len(), 2);
    }

    #[tokio::test]
    async fn photos_upload_eagerly_once_a_draft_exists() {
        let harness = TestHarness::new();
        let services = harness.services();
        let mut session = ConversationSession::new("15550100000");
        session.set_external_draft_id("draft-1");
        accept_photo(&services, &mut session, "m1", PhotoLimits::default()).await;
        assert!(session.photos[0].uploaded);
        assert_eq!(harness.catalog.attached().await, vec!["draft-1".to_string()]);

        harness.catalog.fail_attach(true);
        accept_photo(&services, &mut session, "m2", PhotoLimits::default()).await;
        assert!(!session.photos[1].uploaded);
        assert_eq!(session.photos.len(), 2);
    }
}
