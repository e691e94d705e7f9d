//! Blob store boundary
//!
//! Images live in an external object store; auctions only carry opaque
//! URLs or keys. Reads run stored URLs through `presign_get` so clients
//! can render objects from a private bucket. The passthrough
//! implementation serves setups with public buckets or CDN URLs.

use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Produce a time-limited GET URL for a stored object. Must return
    /// the input unchanged when it cannot presign; image rendering is
    /// never worth failing a read.
    async fn presign_get(&self, url: &str) -> String;
}

/// No-op store: URLs are already publicly fetchable.
pub struct PassthroughMediaStore;

#[async_trait]
impl MediaStore for PassthroughMediaStore {
    async fn presign_get(&self, url: &str) -> String {
        url.to_string()
    }
}

/// Presign a record's image fields in place.
pub async fn presign_auction_images(
    media: &dyn MediaStore,
    record: &mut crate::models::AuctionRecord,
) {
    if let Some(url) = record.image_url.take() {
        record.image_url = Some(media.presign_get(&url).await);
    }
    let mut presigned = Vec::with_capacity(record.gallery_urls.len());
    for url in record.gallery_urls.drain(..) {
        presigned.push(media.presign_get(&url).await);
    }
    record.gallery_urls = presigned;
}
