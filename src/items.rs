//! Marketplace item feed with search filters.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::api::{ApiClient, ApiRequest, ListEndpoint};
use crate::model::{Item, ItemId, LoanRequest};
use crate::sync::{
    CursorPaginator, LiveMergeCollection, QueryParams, SyncResult, SyncedCollection, ViewOrder,
};

pub const ITEMS_PATH: &str = "/v1/items";
pub const LIKED_PATH: &str = "/v1/me/liked";

pub fn liked_path(item_id: ItemId) -> String {
    format!("{}/{}", LIKED_PATH, item_id)
}

pub fn request_path(item_id: ItemId) -> String {
    format!("{}/{}/request", ITEMS_PATH, item_id)
}

/// Search filters of the item feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFilters {
    /// Space separated search words
    pub words: String,
    pub available: bool,
    pub unavailable: bool,
    /// Targeted age range in months, upper bound open when `None`
    pub targeted_age: (u32, Option<u32>),
    pub regions: BTreeSet<i64>,
}

impl Default for ItemFilters {
    fn default() -> Self {
        Self {
            words: String::new(),
            available: true,
            unavailable: false,
            targeted_age: (0, None),
            regions: BTreeSet::new(),
        }
    }
}

impl ItemFilters {
    pub fn is_default(&self) -> bool {
        self.words.trim().is_empty()
            && self.available
            && !self.unavailable
            && self.targeted_age == (0, None)
            && self.regions.is_empty()
    }

    pub fn with_words(mut self, words: impl Into<String>) -> Self {
        self.words = words.into();
        self
    }

    pub fn with_availability(mut self, available: bool, unavailable: bool) -> Self {
        self.available = available;
        self.unavailable = unavailable;
        self
    }

    pub fn with_targeted_age(mut self, min: u32, max: Option<u32>) -> Self {
        self.targeted_age = (min, max);
        self
    }

    pub fn with_region(mut self, region: i64) -> Self {
        self.regions.insert(region);
        self
    }

    /// Query parameters of the item list endpoint (`q`, `av`, `mo`, `reg`)
    pub fn to_query(&self) -> QueryParams {
        let mut query = QueryParams::new();

        for word in self.words.split_whitespace() {
            query.append("q", word);
        }

        match (self.available, self.unavailable) {
            (true, true) => query.insert("av", "all"),
            (false, true) => query.insert("av", "no"),
            _ => {}
        }

        if self.targeted_age != (0, None) {
            let (min, max) = self.targeted_age;
            let max = max.map(|m| m.to_string()).unwrap_or_default();
            query.insert("mo", format!("{}-{}", min, max));
        }

        for region in &self.regions {
            query.append("reg", region);
        }

        query
    }

    /// Inverse of [`to_query`](Self::to_query); unparseable values fall
    /// back to their defaults
    pub fn from_query(query: &QueryParams) -> Self {
        let words = query.get_all("q").collect::<Vec<_>>().join(" ");

        let (available, unavailable) = match query.get("av") {
            Some("all") => (true, true),
            Some("no") => (false, true),
            _ => (true, false),
        };

        let targeted_age = query
            .get("mo")
            .and_then(parse_age_range)
            .unwrap_or((0, None));

        let regions = query
            .get_all("reg")
            .filter_map(|r| r.parse().ok())
            .collect();

        Self {
            words,
            available,
            unavailable,
            targeted_age,
            regions,
        }
    }
}

/// `"3-12"`, `"3-"` or `"-12"`
fn parse_age_range(value: &str) -> Option<(u32, Option<u32>)> {
    let (min, max) = value.split_once('-')?;
    let min = if min.is_empty() { 0 } else { min.parse().ok()? };
    let max = if max.is_empty() {
        None
    } else {
        Some(max.parse().ok()?)
    };
    match max {
        Some(max) if max < min => None,
        _ => Some((min, max)),
    }
}

/// The item search feed
pub struct ItemFeed {
    client: Arc<ApiClient>,
    items: SyncedCollection<Item>,
    filters: Mutex<ItemFilters>,
    page_size: u32,
}

impl ItemFeed {
    pub fn new(client: Arc<ApiClient>, page_size: u32) -> Self {
        let filters = ItemFilters::default();
        let items = SyncedCollection::new(
            CursorPaginator::new(
                "items",
                Arc::new(ListEndpoint::<Item>::new(client.clone(), ITEMS_PATH)),
                Self::query_for(&filters, page_size),
            ),
            LiveMergeCollection::new(ViewOrder::Baseline),
        );

        Self {
            client,
            items,
            filters: Mutex::new(filters),
            page_size,
        }
    }

    fn query_for(filters: &ItemFilters, page_size: u32) -> QueryParams {
        let mut query = filters.to_query();
        query.insert("n", page_size);
        query
    }

    pub fn filters(&self) -> ItemFilters {
        self.filters.lock().clone()
    }

    /// Apply new filters; the feed restarts from the first page when they
    /// differ from the current ones
    pub fn set_filters(&self, filters: ItemFilters) -> bool {
        let query = {
            let mut current = self.filters.lock();
            if *current == filters {
                return false;
            }
            *current = filters;
            Self::query_for(&current, self.page_size)
        };

        debug!("Item filters changed, resetting feed");
        self.items.live().clear_live();
        self.items.reset(query);
        true
    }

    pub fn reset_filters(&self) -> bool {
        self.set_filters(ItemFilters::default())
    }

    pub fn view(&self) -> Vec<Item> {
        self.items.view()
    }

    pub async fn load_more(&self) {
        self.items.load_more().await;
    }

    /// Overlay a locally updated item (edit, like)
    pub fn apply_live(&self, item: Item) -> SyncResult<bool> {
        self.items.apply_live(item)
    }

    pub fn collection(&self) -> &SyncedCollection<Item> {
        &self.items
    }

    /// Like an item; the returned item replaces the local copy
    pub async fn like_item(&self, item_id: ItemId) -> SyncResult<Item> {
        let item: Item = self
            .client
            .fetch_json(ApiRequest::post(liked_path(item_id)))
            .await?;
        debug!("Liked item {}", item_id);
        self.items.apply_live(item.clone())?;
        Ok(item)
    }

    /// Remove a like; an item in the answer replaces the local copy
    pub async fn unlike_item(&self, item_id: ItemId) -> SyncResult<Option<Item>> {
        let response = self
            .client
            .fetch(ApiRequest::delete(liked_path(item_id)))
            .await?;
        debug!("Unliked item {}", item_id);

        let item = response.json::<Item>().ok();
        if let Some(item) = &item {
            self.items.apply_live(item.clone())?;
        }
        Ok(item)
    }

    /// Ask to borrow an item. Never resent after a session refresh.
    pub async fn request_item(&self, item_id: ItemId) -> SyncResult<LoanRequest> {
        let request: LoanRequest = self
            .client
            .fetch_json(ApiRequest::post(request_path(item_id)))
            .await?;
        debug!("Requested item {} in chat {}", item_id, request.chat_id);
        Ok(request)
    }

    /// Withdraw a loan request; the server may answer with the withdrawn
    /// request
    pub async fn unrequest_item(&self, item_id: ItemId) -> SyncResult<Option<LoanRequest>> {
        let response = self
            .client
            .fetch(ApiRequest::delete(request_path(item_id)))
            .await?;
        debug!("Withdrew request for item {}", item_id);
        Ok(response.json::<LoanRequest>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockTransport;
    use crate::api::{ApiResponse, AuthSession, MemoryMarker};
    use crate::sync::SyncError;
    use serde_json::json;

    fn item(id: i64) -> serde_json::Value {
        json!({ "id": id, "name": format!("item {}", id), "available": true, "owner_id": 2 })
    }

    fn feed(transport: Arc<MockTransport>) -> ItemFeed {
        let session = Arc::new(AuthSession::new(Arc::new(MemoryMarker::default())));
        ItemFeed::new(Arc::new(ApiClient::new(transport, session)), 16)
    }

    #[test]
    fn test_filters_to_query() {
        let filters = ItemFilters::default()
            .with_words(" stroller  red ")
            .with_availability(true, true)
            .with_targeted_age(3, Some(12))
            .with_region(7)
            .with_region(2);

        let query = filters.to_query();
        assert_eq!(query.get_all("q").collect::<Vec<_>>(), vec!["stroller", "red"]);
        assert_eq!(query.get("av"), Some("all"));
        assert_eq!(query.get("mo"), Some("3-12"));
        assert_eq!(query.get_all("reg").collect::<Vec<_>>(), vec!["2", "7"]);

        let parsed = ItemFilters::from_query(&query);
        assert_eq!(parsed.words, "stroller red");
        assert_eq!(parsed.targeted_age, (3, Some(12)));
        assert_eq!(parsed.regions, filters.regions);
    }

    #[test]
    fn test_default_filters_are_empty_query() {
        assert!(ItemFilters::default().is_default());
        assert!(ItemFilters::default().to_query().is_empty());
        assert_eq!(
            ItemFilters::default().with_targeted_age(6, None).to_query().get("mo"),
            Some("6-")
        );
        assert_eq!(parse_age_range("12-3"), None);
        assert_eq!(parse_age_range("-12"), Some((0, Some(12))));
    }

    #[tokio::test]
    async fn test_changing_filters_resets_feed() {
        let transport = Arc::new(MockTransport::new());
        transport.on(
            "GET /v1/items",
            ApiResponse::new(200)
                .with_json(json!([item(9), item(4)]))
                .with_header("link", "</v1/items?n=16&cid=4>; rel=\"next\""),
        );
        transport.on("GET /v1/items", ApiResponse::new(200).with_json(json!([item(3)])));
        let feed = feed(transport.clone());

        feed.load_more().await;
        assert_eq!(feed.view().len(), 2);

        assert!(!feed.set_filters(ItemFilters::default()));
        assert!(feed.set_filters(ItemFilters::default().with_words("bike")));
        assert!(feed.view().is_empty());

        feed.load_more().await;
        let calls = transport.calls();
        assert_eq!(calls[1].query.get("q"), Some("bike"));
        assert_eq!(calls[1].query.get("n"), Some("16"));
        assert_eq!(calls[1].query.get("cid"), None);
        assert_eq!(feed.view().len(), 1);
    }

    #[tokio::test]
    async fn test_live_items_keep_server_order() {
        let transport = Arc::new(MockTransport::new());
        transport.on("GET /v1/items", ApiResponse::new(200).with_json(json!([item(3), item(9)])));
        let feed = feed(transport);
        feed.load_more().await;

        let mut liked: Item = serde_json::from_value(item(9)).unwrap();
        liked.likes_count = 1;
        feed.apply_live(liked).unwrap();

        let view = feed.view();
        assert_eq!(view.iter().map(|i| i.id).collect::<Vec<_>>(), vec![3, 9]);
        assert_eq!(view[1].likes_count, 1);
    }

    #[tokio::test]
    async fn test_like_applies_returned_item() {
        let transport = Arc::new(MockTransport::new());
        transport.on("GET /v1/items", ApiResponse::new(200).with_json(json!([item(3), item(9)])));
        let mut liked = item(9);
        liked["likes_count"] = json!(5);
        transport.on("POST /v1/me/liked/9", ApiResponse::new(201).with_json(liked));
        transport.on("DELETE /v1/me/liked/9", ApiResponse::new(204));
        let feed = feed(transport.clone());
        feed.load_more().await;

        let item = feed.like_item(9).await.unwrap();
        assert_eq!(item.likes_count, 5);
        assert_eq!(feed.view()[1].likes_count, 5);

        assert_eq!(feed.unlike_item(9).await.unwrap(), None);
        assert_eq!(transport.count("DELETE /v1/me/liked/9"), 1);
    }

    #[tokio::test]
    async fn test_request_item_is_not_replayed() {
        let transport = Arc::new(MockTransport::new());
        transport.on("POST /v1/items/9/request", ApiResponse::new(401));
        transport.on("POST /v1/auth/refresh", ApiResponse::new(200));
        let session = Arc::new(AuthSession::new(Arc::new(MemoryMarker::new(true))));
        let feed = ItemFeed::new(Arc::new(ApiClient::new(transport.clone(), session)), 16);

        let result = feed.request_item(9).await;

        assert!(matches!(result, Err(SyncError::Unauthorized(_))));
        assert_eq!(transport.count("POST /v1/items/9/request"), 1);
        assert_eq!(transport.count("POST /v1/auth/refresh"), 1);
    }
}
