//! JS interop for `chrome.storage` areas and `window` storage events.
//!
//! When the extension storage API is missing (plain page, tests in a browser runner) the JS side
//! falls back to prefixed `localStorage` entries with the same quota accounting and an in-page
//! change feed. Non-wasm builds get an inert shim so host-side tests and tooling compile.

use settings_host::{StorageChanges, StorageMap};

#[cfg(target_arch = "wasm32")]
mod imp {
    use super::*;
    use js_sys::Promise;
    use serde::Serialize;
    use serde_wasm_bindgen::{from_value, Serializer};
    use wasm_bindgen::{prelude::*, JsCast};
    use wasm_bindgen_futures::JsFuture;

    #[wasm_bindgen(inline_js = r#"
const FALLBACK_PREFIX = 'newtab.settings';
const FALLBACK_QUOTAS = { sync: 102400, local: 5242880 };
const fallbackListeners = { sync: new Map(), local: new Map() };
const extensionHandlers = new Map();
let nextToken = 1;

function extensionArea(area) {
  if (typeof chrome === 'undefined' || !chrome.storage || !chrome.storage[area]) return null;
  return chrome.storage[area];
}

function callArea(area, method, ...args) {
  const target = extensionArea(area);
  return new Promise((resolve, reject) => {
    try {
      target[method](...args, (value) => {
        const err = chrome.runtime && chrome.runtime.lastError;
        if (err) reject(new Error(err.message || String(err)));
        else resolve(value);
      });
    } catch (err) {
      reject(err);
    }
  });
}

function fallbackStorage() {
  if (typeof localStorage === 'undefined') throw new Error('no storage backend available');
  return localStorage;
}

function fallbackPrefix(area) {
  return `${FALLBACK_PREFIX}.${area}:`;
}

function fallbackRead(area) {
  const storage = fallbackStorage();
  const prefix = fallbackPrefix(area);
  const out = {};
  for (let i = 0; i < storage.length; i++) {
    const key = storage.key(i);
    if (!key || !key.startsWith(prefix)) continue;
    try {
      out[key.slice(prefix.length)] = JSON.parse(storage.getItem(key));
    } catch (_) {}
  }
  return out;
}

function itemSize(key, value) {
  return key.length + JSON.stringify(value).length;
}

function mapSize(items) {
  return Object.entries(items).reduce((sum, [key, value]) => sum + itemSize(key, value), 0);
}

function fallbackEmit(area, changes) {
  if (Object.keys(changes).length === 0) return;
  for (const callback of fallbackListeners[area].values()) {
    try {
      callback(changes);
    } catch (err) {
      console.error(err);
    }
  }
}

function fallbackSet(area, items) {
  const current = fallbackRead(area);
  const next = Object.assign({}, current, items);
  if (mapSize(next) > FALLBACK_QUOTAS[area]) {
    throw new Error(`QUOTA_BYTES quota exceeded for ${area}`);
  }
  const storage = fallbackStorage();
  const prefix = fallbackPrefix(area);
  const changes = {};
  for (const [key, value] of Object.entries(items)) {
    const raw = JSON.stringify(value);
    storage.setItem(prefix + key, raw);
    if (!(key in current)) changes[key] = { newValue: value };
    else if (JSON.stringify(current[key]) !== raw) changes[key] = { oldValue: current[key], newValue: value };
  }
  fallbackEmit(area, changes);
}

function fallbackRemove(area, keys) {
  const current = fallbackRead(area);
  const storage = fallbackStorage();
  const prefix = fallbackPrefix(area);
  const changes = {};
  for (const key of keys) {
    if (!(key in current)) continue;
    storage.removeItem(prefix + key);
    changes[key] = { oldValue: current[key] };
  }
  fallbackEmit(area, changes);
}

export async function jsStorageGet(area, keys) {
  if (extensionArea(area)) return await callArea(area, 'get', keys);
  const all = fallbackRead(area);
  const out = {};
  for (const key of keys) if (key in all) out[key] = all[key];
  return out;
}

export async function jsStorageGetAll(area) {
  if (extensionArea(area)) return await callArea(area, 'get', null);
  return fallbackRead(area);
}

export async function jsStorageSet(area, items) {
  if (extensionArea(area)) return await callArea(area, 'set', items);
  fallbackSet(area, items);
  return null;
}

export async function jsStorageRemove(area, keys) {
  if (extensionArea(area)) return await callArea(area, 'remove', keys);
  fallbackRemove(area, keys);
  return null;
}

export async function jsStorageClear(area) {
  if (extensionArea(area)) return await callArea(area, 'clear');
  fallbackRemove(area, Object.keys(fallbackRead(area)));
  return null;
}

export async function jsStorageBytesInUse(area) {
  if (extensionArea(area)) return await callArea(area, 'getBytesInUse', null);
  return mapSize(fallbackRead(area));
}

export function jsStorageQuota(area) {
  const target = extensionArea(area);
  if (target && typeof target.QUOTA_BYTES === 'number') return target.QUOTA_BYTES;
  return FALLBACK_QUOTAS[area];
}

export function jsStorageSubscribe(area, callback) {
  const token = nextToken++;
  if (typeof chrome !== 'undefined' && chrome.storage && chrome.storage.onChanged) {
    const handler = (changes, areaName) => {
      if (areaName === area) callback(changes);
    };
    chrome.storage.onChanged.addListener(handler);
    extensionHandlers.set(token, handler);
  } else {
    fallbackListeners[area].set(token, callback);
  }
  return token;
}

export function jsStorageUnsubscribe(area, token) {
  const handler = extensionHandlers.get(token);
  if (handler) {
    chrome.storage.onChanged.removeListener(handler);
    extensionHandlers.delete(token);
  }
  fallbackListeners[area].delete(token);
}
"#)]
    extern "C" {
        #[wasm_bindgen(js_name = jsStorageGet)]
        fn js_storage_get(area: &str, keys: JsValue) -> Promise;
        #[wasm_bindgen(js_name = jsStorageGetAll)]
        fn js_storage_get_all(area: &str) -> Promise;
        #[wasm_bindgen(js_name = jsStorageSet)]
        fn js_storage_set(area: &str, items: JsValue) -> Promise;
        #[wasm_bindgen(js_name = jsStorageRemove)]
        fn js_storage_remove(area: &str, keys: JsValue) -> Promise;
        #[wasm_bindgen(js_name = jsStorageClear)]
        fn js_storage_clear(area: &str) -> Promise;
        #[wasm_bindgen(js_name = jsStorageBytesInUse)]
        fn js_storage_bytes_in_use(area: &str) -> Promise;
        #[wasm_bindgen(js_name = jsStorageQuota)]
        fn js_storage_quota(area: &str) -> f64;
        #[wasm_bindgen(js_name = jsStorageSubscribe)]
        fn js_storage_subscribe(area: &str, callback: &Closure<dyn FnMut(JsValue)>) -> u32;
        #[wasm_bindgen(js_name = jsStorageUnsubscribe)]
        fn js_storage_unsubscribe(area: &str, token: u32);
    }

    async fn await_promise(promise: Promise) -> Result<JsValue, String> {
        JsFuture::from(promise).await.map_err(js_error_to_string)
    }

    fn js_error_to_string(err: JsValue) -> String {
        if let Some(text) = err.as_string() {
            return text;
        }
        if let Ok(message) = js_sys::Reflect::get(&err, &JsValue::from_str("message")) {
            if let Some(text) = message.as_string() {
                return text;
            }
        }
        format!("{err:?}")
    }

    fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, String> {
        value
            .serialize(&Serializer::json_compatible())
            .map_err(|e| e.to_string())
    }

    fn to_map(value: JsValue) -> Result<StorageMap, String> {
        if value.is_null() || value.is_undefined() {
            return Ok(StorageMap::new());
        }
        from_value(value).map_err(|e| e.to_string())
    }

    pub async fn storage_get(area: &str, keys: &[String]) -> Result<StorageMap, String> {
        to_map(await_promise(js_storage_get(area, to_js(keys)?)).await?)
    }

    pub async fn storage_get_all(area: &str) -> Result<StorageMap, String> {
        to_map(await_promise(js_storage_get_all(area)).await?)
    }

    pub async fn storage_set(area: &str, items: &StorageMap) -> Result<(), String> {
        let _ = await_promise(js_storage_set(area, to_js(items)?)).await?;
        Ok(())
    }

    pub async fn storage_remove(area: &str, keys: &[String]) -> Result<(), String> {
        let _ = await_promise(js_storage_remove(area, to_js(keys)?)).await?;
        Ok(())
    }

    pub async fn storage_clear(area: &str) -> Result<(), String> {
        let _ = await_promise(js_storage_clear(area)).await?;
        Ok(())
    }

    pub async fn storage_bytes_in_use(area: &str) -> Result<u64, String> {
        let value = await_promise(js_storage_bytes_in_use(area)).await?;
        value
            .as_f64()
            .map(|bytes| bytes.max(0.0) as u64)
            .ok_or_else(|| "bytes-in-use measurement returned a non-number".to_string())
    }

    pub fn storage_quota(area: &str) -> u64 {
        js_storage_quota(area).max(0.0) as u64
    }

    /// Keeps one JS change-feed registration alive; unregisters on drop.
    pub struct ChangeFeedHandle {
        area: &'static str,
        token: u32,
        _callback: Closure<dyn FnMut(JsValue)>,
    }

    impl Drop for ChangeFeedHandle {
        fn drop(&mut self) {
            js_storage_unsubscribe(self.area, self.token);
        }
    }

    pub fn subscribe_changes(
        area: &'static str,
        on_change: impl Fn(StorageChanges) + 'static,
    ) -> Result<ChangeFeedHandle, String> {
        let callback = Closure::<dyn FnMut(JsValue)>::wrap(Box::new(move |value: JsValue| {
            match from_value::<StorageChanges>(value) {
                Ok(changes) => on_change(changes),
                Err(err) => tracing::warn!(area, error = %err, "dropping undecodable change batch"),
            }
        }));
        let token = js_storage_subscribe(area, &callback);
        Ok(ChangeFeedHandle {
            area,
            token,
            _callback: callback,
        })
    }

    fn local_storage() -> Result<web_sys::Storage, String> {
        web_sys::window()
            .and_then(|w| w.local_storage().ok().flatten())
            .ok_or_else(|| "localStorage unavailable".to_string())
    }

    pub fn slot_write(key: &str, payload: &str) -> Result<(), String> {
        local_storage()?
            .set_item(key, payload)
            .map_err(|e| format!("localStorage set_item failed: {}", js_error_to_string(e)))
    }

    pub fn slot_read(key: &str) -> Option<String> {
        local_storage().ok()?.get_item(key).ok().flatten()
    }

    /// Keeps a `storage` event listener attached to `window`; detaches on drop.
    pub struct StorageEventHandle {
        callback: Closure<dyn FnMut(web_sys::StorageEvent)>,
    }

    impl Drop for StorageEventHandle {
        fn drop(&mut self) {
            if let Some(window) = web_sys::window() {
                let _ = window.remove_event_listener_with_callback(
                    "storage",
                    self.callback.as_ref().unchecked_ref(),
                );
            }
        }
    }

    pub fn watch_storage_key(
        key: &str,
        on_value: impl Fn(String) + 'static,
    ) -> Result<StorageEventHandle, String> {
        let window = web_sys::window().ok_or_else(|| "window unavailable".to_string())?;
        let watched = key.to_string();
        let callback =
            Closure::<dyn FnMut(web_sys::StorageEvent)>::wrap(Box::new(move |event| {
                if event.key().as_deref() != Some(watched.as_str()) {
                    return;
                }
                if let Some(value) = event.new_value() {
                    on_value(value);
                }
            }));
        window
            .add_event_listener_with_callback("storage", callback.as_ref().unchecked_ref())
            .map_err(js_error_to_string)?;
        Ok(StorageEventHandle { callback })
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod imp {
    use std::{cell::RefCell, collections::HashMap};

    use settings_host::{LOCAL_AREA_QUOTA_BYTES, REPLICATED_AREA_QUOTA_BYTES};

    use super::*;

    thread_local! {
        static SLOT_VALUES: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
    }

    fn unsupported() -> String {
        "Browser storage APIs are only available when compiled for wasm32".to_string()
    }

    pub async fn storage_get(_area: &str, _keys: &[String]) -> Result<StorageMap, String> {
        Err(unsupported())
    }

    pub async fn storage_get_all(_area: &str) -> Result<StorageMap, String> {
        Err(unsupported())
    }

    pub async fn storage_set(_area: &str, _items: &StorageMap) -> Result<(), String> {
        Err(unsupported())
    }

    pub async fn storage_remove(_area: &str, _keys: &[String]) -> Result<(), String> {
        Err(unsupported())
    }

    pub async fn storage_clear(_area: &str) -> Result<(), String> {
        Err(unsupported())
    }

    pub async fn storage_bytes_in_use(_area: &str) -> Result<u64, String> {
        Err(unsupported())
    }

    pub fn storage_quota(area: &str) -> u64 {
        match area {
            "sync" => REPLICATED_AREA_QUOTA_BYTES,
            _ => LOCAL_AREA_QUOTA_BYTES,
        }
    }

    pub struct ChangeFeedHandle;

    pub fn subscribe_changes(
        _area: &'static str,
        on_change: impl Fn(StorageChanges) + 'static,
    ) -> Result<ChangeFeedHandle, String> {
        let _ = on_change;
        Ok(ChangeFeedHandle)
    }

    pub fn slot_write(key: &str, payload: &str) -> Result<(), String> {
        SLOT_VALUES.with(|values| {
            values
                .borrow_mut()
                .insert(key.to_string(), payload.to_string())
        });
        Ok(())
    }

    pub fn slot_read(key: &str) -> Option<String> {
        SLOT_VALUES.with(|values| values.borrow().get(key).cloned())
    }

    pub struct StorageEventHandle;

    pub fn watch_storage_key(
        _key: &str,
        on_value: impl Fn(String) + 'static,
    ) -> Result<StorageEventHandle, String> {
        let _ = on_value;
        Ok(StorageEventHandle)
    }
}

pub(crate) use imp::{
    slot_read, slot_write, storage_bytes_in_use, storage_clear, storage_get, storage_get_all,
    storage_quota, storage_remove, storage_set, subscribe_changes, watch_storage_key,
    ChangeFeedHandle, StorageEventHandle,
};

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn storage_api_non_wasm_parity() {
        let expected =
            "Browser storage APIs are only available when compiled for wasm32".to_string();
        assert_eq!(
            block_on(storage_get_all("sync")).expect_err("get all should fail"),
            expected
        );
        assert_eq!(
            block_on(storage_set("local", &StorageMap::new())).expect_err("set should fail"),
            expected
        );
        assert_eq!(storage_quota("sync"), 102_400);
        assert_eq!(storage_quota("local"), 5_242_880);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn slot_shim_keeps_last_value() {
        slot_write("bridge-test-slot", "{\"key\":\"a\"}").expect("write");
        assert_eq!(
            slot_read("bridge-test-slot").as_deref(),
            Some("{\"key\":\"a\"}")
        );
        assert_eq!(slot_read("bridge-test-missing"), None);
    }
}
