//! [`CalendarFetcher`] backed by Exchange.

use roombook_core::{ResourceIdentifier, Room, TimeWindow};
use tracing::{debug, instrument, warn};

use crate::account::AccountItem;
use crate::error::{UpstreamError, UpstreamResult};
use crate::provider::{BoxFuture, CalendarFetcher};
use crate::raw_event::RawEvent;

use super::client::ExchangeClient;
use super::config::ExchangeConfig;
use super::ews::{availability_request, parse_availability_response};
use super::ics::parse_calendar;
use super::items::{
    ItemMessage, find_items_request, get_items_request, parse_find_items_response,
    parse_get_items_response,
};

/// Reads room calendars from Exchange.
pub struct ExchangeFetcher {
    client: ExchangeClient,
}

impl ExchangeFetcher {
    pub fn new(config: ExchangeConfig) -> UpstreamResult<Self> {
        Ok(Self {
            client: ExchangeClient::new(config)?,
        })
    }

    pub fn config(&self) -> &ExchangeConfig {
        self.client.config()
    }

    #[instrument(skip(self, window), fields(start = %window.start, end = %window.end))]
    async fn fetch_mailbox(
        &self,
        mailbox: &str,
        window: &TimeWindow,
    ) -> UpstreamResult<Vec<RawEvent>> {
        let Some(ews_url) = self.config().ews_url.as_ref() else {
            return Err(UpstreamError::auth(
                "room is backed by a mailbox but no EWS endpoint is configured",
            ));
        };
        let envelope =
            availability_request(mailbox, window, self.config().merged_free_busy_interval)?;
        let body = self.client.post_soap(ews_url, envelope).await?;
        let events = parse_availability_response(&body)?;
        debug!(count = events.len(), "fetched free/busy view");
        Ok(events)
    }

    #[instrument(skip(self, window), fields(url = %url))]
    async fn fetch_feed(
        &self,
        url: &url::Url,
        window: &TimeWindow,
    ) -> UpstreamResult<Vec<RawEvent>> {
        let body = self.client.get(url).await?;
        let events = parse_calendar(&body, window, self.config().timezone)?;
        debug!(count = events.len(), "fetched ICS feed");
        Ok(events)
    }

    fn ews_url(&self) -> UpstreamResult<&url::Url> {
        self.config()
            .ews_url
            .as_ref()
            .ok_or_else(|| UpstreamError::auth("no EWS endpoint is configured"))
    }

    async fn get_items(&self, item_ids: &[String]) -> UpstreamResult<Vec<ItemMessage>> {
        let envelope = get_items_request(item_ids)?;
        let body = self.client.post_soap(self.ews_url()?, envelope).await?;
        parse_get_items_response(&body)
    }

    #[instrument(skip(self, window), fields(start = %window.start, end = %window.end))]
    async fn find_account_items(&self, window: &TimeWindow) -> UpstreamResult<Vec<AccountItem>> {
        let envelope = find_items_request(window.start, window.end)?;
        let body = self.client.post_soap(self.ews_url()?, envelope).await?;
        let ids = parse_find_items_response(&body)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut items = Vec::with_capacity(ids.len());
        for message in self.get_items(&ids).await? {
            match message {
                ItemMessage::Found(item) => items.push(item),
                ItemMessage::Failed { code, message } => {
                    // Deleted between the two calls, most likely.
                    warn!(%code, %message, "calendar item could not be read, skipping");
                }
            }
        }
        debug!(count = items.len(), "fetched account calendar");
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn get_account_item(&self, item_id: &str) -> UpstreamResult<Option<AccountItem>> {
        let messages = self.get_items(&[item_id.to_string()]).await?;
        match messages.into_iter().next() {
            Some(ItemMessage::Found(item)) => Ok(Some(item)),
            Some(message) if message.is_missing() => Ok(None),
            Some(ItemMessage::Failed { code, message }) => {
                Err(UpstreamError::malformed(format!("{code}: {message}")))
            }
            None => Ok(None),
        }
    }
}

impl CalendarFetcher for ExchangeFetcher {
    fn name(&self) -> &str {
        "exchange"
    }

    fn fetch<'a>(
        &'a self,
        room: &'a Room,
        window: &'a TimeWindow,
    ) -> BoxFuture<'a, UpstreamResult<Vec<RawEvent>>> {
        Box::pin(async move {
            let result = match &room.resource {
                ResourceIdentifier::Mailbox(mailbox) => self.fetch_mailbox(mailbox, window).await,
                ResourceIdentifier::IcsUrl(url) => self.fetch_feed(url, window).await,
            };
            result.map_err(|e| e.with_room(&room.id))
        })
    }

    fn account_items<'a>(
        &'a self,
        window: &'a TimeWindow,
    ) -> BoxFuture<'a, UpstreamResult<Vec<AccountItem>>> {
        Box::pin(self.find_account_items(window))
    }

    fn account_item<'a>(
        &'a self,
        item_id: &'a str,
    ) -> BoxFuture<'a, UpstreamResult<Option<AccountItem>>> {
        Box::pin(self.get_account_item(item_id))
    }
}
