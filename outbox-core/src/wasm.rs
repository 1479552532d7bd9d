//! WebAssembly bindings for outbox-core.
//!
//! Lets a plain page script (no worker registered) keep its fallback queue
//! in `window.localStorage`, retry it over `fetch`, and reconcile worker
//! broadcasts.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use crate::fallback::LocalFallbackQueue;
use crate::message::Notification;
use crate::reconcile::PageView;
use crate::request::{
    current_timestamp_ms, IdempotencyKey, MutatingRequest, QueuedRequest, DEFAULT_SYNC_TAG,
};
use crate::storage::KeyValueStorage;
use crate::store::{QueueStore, StoreError};
use crate::transport::{DeliveryResponse, Transport, TransportError};

/// Initialize the outbox WASM module.
#[wasm_bindgen(start)]
pub fn init() {
    // Set up panic hook for better error messages
    console_error_panic_hook::set_once();
}

/// `window.localStorage`, looked up on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebStorage;

impl WebStorage {
    fn storage() -> Result<web_sys::Storage, StoreError> {
        web_sys::window()
            .ok_or_else(|| StoreError::Unavailable("no window".into()))?
            .local_storage()
            .map_err(|e| StoreError::Unavailable(format!("{e:?}")))?
            .ok_or_else(|| StoreError::Unavailable("localStorage disabled".into()))
    }
}

impl KeyValueStorage for WebStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        Self::storage()?
            .get_item(key)
            .map_err(|e| StoreError::Unavailable(format!("{e:?}")))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Self::storage()?
            .set_item(key, value)
            .map_err(|e| StoreError::Unavailable(format!("{e:?}")))
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        Self::storage()?
            .remove_item(key)
            .map_err(|e| StoreError::Unavailable(format!("{e:?}")))
    }
}

/// Delivers queued requests with `window.fetch`.
///
/// Origin-relative URLs resolve against the page, as they would for any
/// other `fetch` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchTransport;

fn js_error(e: &JsValue) -> String {
    e.as_string().unwrap_or_else(|| format!("{e:?}"))
}

#[async_trait(?Send)]
impl Transport for FetchTransport {
    async fn deliver(&self, request: &QueuedRequest) -> Result<DeliveryResponse, TransportError> {
        let window = web_sys::window().ok_or(TransportError::Offline)?;

        // Request construction throws only for inputs no retry can fix
        let headers = web_sys::Headers::new().map_err(|e| TransportError::Invalid(js_error(&e)))?;
        for (name, value) in &request.headers {
            headers
                .append(name, value)
                .map_err(|e| TransportError::Invalid(js_error(&e)))?;
        }
        let init = web_sys::RequestInit::new();
        init.set_method(request.method.as_str());
        init.set_headers(&headers);
        if !request.body.is_empty() {
            init.set_body(&js_sys::Uint8Array::from(request.body.as_bytes()));
        }
        let outgoing = web_sys::Request::new_with_str_and_init(&request.url, &init)
            .map_err(|e| TransportError::Invalid(js_error(&e)))?;

        // fetch rejects only when no response arrived
        let response: web_sys::Response = JsFuture::from(window.fetch_with_request(&outgoing))
            .await
            .map_err(|e| TransportError::Connect(js_error(&e)))?
            .dyn_into()
            .map_err(|e| TransportError::Connect(js_error(&e)))?;

        let status = response.status();
        let body = match response.text() {
            Ok(text) => JsFuture::from(text)
                .await
                .ok()
                .and_then(|value| value.as_string())
                .unwrap_or_default(),
            Err(e) => {
                tracing::debug!(key = %request.key, "Response body unreadable: {}", js_error(&e));
                String::new()
            }
        };
        Ok(DeliveryResponse::new(status, body))
    }
}

/// Fallback queue and reconciled view for one page.
#[wasm_bindgen]
pub struct WasmOutbox {
    queue: LocalFallbackQueue<WebStorage>,
    view: Rc<RefCell<PageView>>,
}

#[wasm_bindgen]
impl WasmOutbox {
    /// Create an outbox over `localStorage`.
    #[wasm_bindgen(constructor)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: LocalFallbackQueue::new(WebStorage),
            view: Rc::new(RefCell::new(PageView::new(DEFAULT_SYNC_TAG))),
        }
    }

    /// Queue a JSON order and return its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error string if storage is unavailable or full.
    #[wasm_bindgen(js_name = addQueuedOrder)]
    pub fn add_queued_order(
        &mut self,
        url: &str,
        body: &str,
        key: Option<String>,
    ) -> Result<String, String> {
        let mut request = MutatingRequest::post_json(url, body);
        if let Some(key) = key {
            request = request.with_key(key);
        }
        let queued = request
            .into_queued(DEFAULT_SYNC_TAG, current_timestamp_ms())
            .map_err(|e| e.to_string())?;
        let key = queued.key.clone();
        self.queue
            .add_queued_order(queued)
            .map_err(|e| e.to_string())?;
        self.view.borrow_mut().mark_pending(key.clone());
        Ok(key.to_string())
    }

    /// The pending operations as a JSON array.
    #[wasm_bindgen(js_name = queuedOrdersJson)]
    #[must_use]
    pub fn queued_orders_json(&self) -> String {
        self.queue
            .queued_orders()
            .ok()
            .and_then(|ops| serde_json::to_string(&ops).ok())
            .unwrap_or_else(|| "[]".to_string())
    }

    /// Drop an entry the page delivered itself.
    ///
    /// # Errors
    ///
    /// Returns an error string if storage is unavailable.
    #[wasm_bindgen(js_name = removeQueuedOrder)]
    pub fn remove_queued_order(&mut self, key: &str) -> Result<(), String> {
        self.queue
            .store()
            .remove(&IdempotencyKey::from(key))
            .map_err(|e| e.to_string())
    }

    /// Seed the pending view from current storage contents.
    ///
    /// # Errors
    ///
    /// Returns an error string if storage is unavailable.
    pub fn mount(&mut self) -> Result<(), String> {
        let items = self.queue.store().list_all().map_err(|e| e.to_string())?;
        self.view.borrow_mut().mount_from_items(&items);
        Ok(())
    }

    /// Apply a worker broadcast; returns a navigation target if one results.
    ///
    /// # Errors
    ///
    /// Returns an error string if the message is not a known notification.
    #[wasm_bindgen(js_name = applyNotification)]
    pub fn apply_notification(&mut self, json: &str) -> Result<Option<String>, String> {
        let notification: Notification = serde_json::from_str(json).map_err(|e| e.to_string())?;
        Ok(self.view.borrow_mut().apply(&notification).map(|n| n.target))
    }

    /// Whether the page should render `key` as pending.
    #[wasm_bindgen(js_name = isPending)]
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.view.borrow().is_pending(&IdempotencyKey::from(key))
    }

    /// Where the page should go after the last confirmed order, if anywhere.
    #[wasm_bindgen(js_name = navigationTarget)]
    #[must_use]
    pub fn navigation_target(&self) -> Option<String> {
        self.view.borrow().navigation().map(|n| n.target.clone())
    }

    /// Run one retry pass over `fetch`.
    ///
    /// Resolves to the keys confirmed by the server; each one is also applied
    /// to the view as an `ORDER_SYNCED`. Rejects with an error string if
    /// storage is unavailable.
    #[wasm_bindgen(js_name = retryQueuedOrders)]
    pub fn retry_queued_orders(&self) -> js_sys::Promise {
        let queue = self.queue.clone();
        let view = Rc::clone(&self.view);
        wasm_bindgen_futures::future_to_promise(async move {
            let synced = js_sys::Array::new();
            queue
                .retry_queued_orders(&FetchTransport, |key, order_id| {
                    view.borrow_mut().apply(&Notification::OrderSynced {
                        key: Some(key.clone()),
                        order_id: order_id.map(str::to_string),
                    });
                    synced.push(&JsValue::from_str(key.as_str()));
                })
                .await
                .map_err(|e| JsValue::from_str(&e.to_string()))?;
            Ok(synced.into())
        })
    }
}

impl Default for WasmOutbox {
    fn default() -> Self {
        Self::new()
    }
}
