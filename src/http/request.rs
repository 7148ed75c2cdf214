//! Parsed request state and the response-header list.

use crate::buffer::ByteRef;
use crate::io::filter::FilterChain;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Response population progress. Headers freeze once the state leaves
/// `Unhandled`; `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Nothing has been sent or staged for sending.
    Unhandled,
    /// At least the response headers are staged.
    Populating,
    /// The response is fully populated.
    Finished,
}

/// Insertion-ordered response headers with case-insensitive lookup.
///
/// An ordered vector of entries plus a lowercase-name index kept in sync.
/// `append` always adds a new entry; each entry serializes on its own
/// line, which is what multi-valued headers like `Set-Cookie` need.
#[derive(Debug, Default)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
    index: HashMap<String, Vec<usize>>,
}

impl HeaderList {
    pub fn new() -> Self {
        HeaderList::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_ascii_lowercase())
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let indices = self.index.get(&name.to_ascii_lowercase())?;
        indices
            .first()
            .map(|&i| self.entries[i].1.as_str())
    }

    /// Adds a new entry, keeping any existing entries with the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_owned(), value.to_owned()));
        self.index
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(self.entries.len() - 1);
    }

    /// Replaces the first entry with `name`, or adds one.
    pub fn overwrite(&mut self, name: &str, value: &str) {
        match self
            .index
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
        {
            Some(&i) => self.entries[i].1 = value.to_owned(),
            None => self.append(name, value),
        }
    }

    /// Removes every entry with `name`.
    pub fn remove(&mut self, name: &str) {
        let lower = name.to_ascii_lowercase();
        if self.index.remove(&lower).is_none() {
            return;
        }
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.rebuild_index();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, (name, _)) in self.entries.iter().enumerate() {
            self.index
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(i);
        }
    }
}

/// Type-keyed per-request values attached by handlers for the request's
/// lifetime.
#[derive(Default)]
pub struct CustomData {
    map: HashMap<TypeId, Box<dyn Any>>,
}

impl CustomData {
    pub fn set<T: Any>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>())?.downcast_mut()
    }

    pub fn take<T: Any>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast().ok())
            .map(|b| *b)
    }
}

/// One parsed HTTP request and the response being populated for it.
/// Created when a message begins on a connection, torn down when the
/// connection resumes for the next message or is released.
pub(crate) struct HttpRequest {
    pub(crate) method: ByteRef,
    pub(crate) uri: ByteRef,
    pub(crate) path: ByteRef,
    pub(crate) query: ByteRef,
    pub(crate) version: (u8, u8),

    pub(crate) hostname: String,
    pub(crate) pathinfo: String,
    pub(crate) document_root: String,
    pub(crate) username: String,

    pub(crate) request_headers: Vec<(ByteRef, ByteRef)>,
    pub(crate) content_length: Option<u64>,
    pub(crate) chunked_body: bool,
    pub(crate) expecting_continue: bool,

    pub(crate) status: Option<u16>,
    pub(crate) response_headers: HeaderList,
    pub(crate) output_state: OutputState,
    pub(crate) bytes_transmitted: u64,
    pub(crate) output_filters: Rc<RefCell<FilterChain>>,
    /// Response framing, decided when the headers are serialized.
    pub(crate) chunked_response: bool,

    pub(crate) body_callback: Option<Box<dyn FnMut(ByteRef)>>,
    pub(crate) abort_handler: Option<Box<dyn FnOnce()>>,
    pub(crate) custom_data: CustomData,
}

impl HttpRequest {
    pub(crate) fn new() -> Self {
        HttpRequest {
            method: ByteRef::empty(),
            uri: ByteRef::empty(),
            path: ByteRef::empty(),
            query: ByteRef::empty(),
            version: (1, 1),
            hostname: String::new(),
            pathinfo: String::new(),
            document_root: String::new(),
            username: String::new(),
            request_headers: Vec::new(),
            content_length: None,
            chunked_body: false,
            expecting_continue: false,
            status: None,
            response_headers: HeaderList::new(),
            output_state: OutputState::Unhandled,
            bytes_transmitted: 0,
            output_filters: Rc::new(RefCell::new(FilterChain::new())),
            chunked_response: false,
            body_callback: None,
            abort_handler: None,
            custom_data: CustomData::default(),
        }
    }

    /// First request header matching `name`, case-insensitively.
    pub(crate) fn request_header(&self, name: &[u8]) -> Option<ByteRef> {
        self.request_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_case(name))
            .map(|(_, v)| v.clone())
    }

    pub(crate) fn is_head(&self) -> bool {
        self.method == b"HEAD" as &[u8]
    }

    /// Does the request announce a body at all?
    pub(crate) fn content_available(&self) -> bool {
        self.chunked_body || self.content_length.is_some_and(|n| n > 0)
    }

    pub(crate) fn supports_protocol(&self, major: u8, minor: u8) -> bool {
        self.version.0 > major || (self.version.0 == major && self.version.1 >= minor)
    }

    /// Statuses and methods that must not carry a response body.
    pub(crate) fn is_response_content_forbidden(&self) -> bool {
        self.is_head()
            || super::types::content_forbidden(self.status.unwrap_or(200))
    }
}


#[cfg(test)]
mod custom_data_tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct PluginState(u32);

    #[test]
    fn typed_round_trip() {
        let mut data = CustomData::default();
        assert!(data.get::<PluginState>().is_none());

        data.set(PluginState(7));
        assert_eq!(data.get::<PluginState>(), Some(&PluginState(7)));

        data.get_mut::<PluginState>().unwrap().0 = 8;
        assert_eq!(data.take::<PluginState>(), Some(PluginState(8)));
        assert!(data.get::<PluginState>().is_none());
    }
}
