/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use crate::http::{HttpMessage, Message};

/// An HTTP request: method, URL, query string and a [`Message`]
#[derive(Debug, Clone)]
pub struct Request {
    message: Message,
    method: String,
    url: String,
    query: String,
}

impl Request {
    /// A `GET` request for `url`; a `?query` suffix is split off.
    pub fn new(url: &str) -> Self {
        Self::with_method("GET", url)
    }

    pub fn with_method(method: &str, url: &str) -> Self {
        let mut request = Self {
            message: Message::new(),
            method: method.to_owned(),
            url: String::new(),
            query: String::new(),
        };
        request.set_target(url);
        request
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn set_method(&mut self, method: &str) {
        self.method = method.to_owned();
    }

    /// The path, without query string.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: &str) {
        self.url = url.to_owned();
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn set_query(&mut self, query: &str) {
        self.query = query.to_owned();
    }

    /// URL and query string as they appear in the request line.
    pub fn target(&self) -> String {
        match self.query.is_empty() {
            true => self.url.clone(),
            false => format!("{}?{}", self.url, self.query),
        }
    }

    pub fn set_target(&mut self, target: &str) {
        match target.split_once('?') {
            Some((url, query)) => {
                self.url = url.to_owned();
                self.query = query.to_owned();
            },
            None => {
                self.url = target.to_owned();
                self.query.clear();
            },
        }
        if self.url.is_empty() {
            self.url.push('/');
        }
    }

    /// Makes the request reusable for a new exchange.
    pub fn clear(&mut self) {
        self.message.clear();
        self.method = "GET".to_owned();
        self.url = "/".to_owned();
        self.query.clear();
    }
}

impl HttpMessage for Request {
    fn message(&self) -> &Message {
        &self.message
    }

    fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    fn start_line(&self) -> String {
        let (major, minor) = self.message.header().version();
        format!("{} {} HTTP/{}.{}", self.method, self.target(), major, minor)
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_query() {
        let request = Request::with_method("POST", "/api/items?limit=5&sort=asc");
        assert_eq!(request.url(), "/api/items");
        assert_eq!(request.query(), "limit=5&sort=asc");
        assert_eq!(request.start_line(), "POST /api/items?limit=5&sort=asc HTTP/1.1");
    }

    #[test]
    fn empty_url_is_root() {
        let request = Request::new("");
        assert_eq!(request.start_line(), "GET / HTTP/1.1");
    }
}
