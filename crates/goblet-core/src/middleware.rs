//! Before/after middleware keyed by event kind.

use crate::dispatch::EventKind;
use crate::request::{Request, Response};
use std::sync::Arc;

pub type BeforeFn = Arc<dyn Fn(Request) -> Request + Send + Sync>;
pub type AfterFn = Arc<dyn Fn(Response) -> Response + Send + Sync>;

/// Which invocations a middleware applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    All,
    Kind(EventKind),
}

impl Selector {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            Selector::All => true,
            Selector::Kind(k) => *k == kind,
        }
    }
}

impl From<EventKind> for Selector {
    fn from(kind: EventKind) -> Self {
        Selector::Kind(kind)
    }
}

/// Registration-ordered middleware lists. Never mutated during dispatch.
#[derive(Clone, Default)]
pub struct Middleware {
    before: Vec<(Selector, BeforeFn)>,
    after: Vec<(Selector, AfterFn)>,
}

impl Middleware {
    pub fn add_before(&mut self, selector: Selector, f: BeforeFn) {
        self.before.push((selector, f));
    }

    pub fn add_after(&mut self, selector: Selector, f: AfterFn) {
        self.after.push((selector, f));
    }

    pub fn apply_before(&self, kind: EventKind, request: Request) -> Request {
        self.before
            .iter()
            .filter(|(s, _)| s.matches(kind))
            .fold(request, |req, (_, f)| f(req))
    }

    pub fn apply_after(&self, kind: EventKind, response: Response) -> Response {
        self.after
            .iter()
            .filter(|(s, _)| s.matches(kind))
            .fold(response, |resp, (_, f)| f(resp))
    }

    /// Append `other`'s entries after this chain's.
    pub fn extend(&mut self, other: &Middleware) {
        self.before.extend(other.before.iter().cloned());
        self.after.extend(other.after.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registration_order_and_selectors() {
        let mut mw = Middleware::default();
        mw.add_before(Selector::All, Arc::new(|r: Request| r.with_header("X-Trail", "a")));
        mw.add_before(
            Selector::Kind(EventKind::Route),
            Arc::new(|r: Request| {
                let trail = format!("{}b", r.header("X-Trail").unwrap_or_default());
                r.with_header("X-Trail", &trail)
            }),
        );
        mw.add_before(Selector::Kind(EventKind::PubSub), Arc::new(|r: Request| r.with_header("X-Trail", "pubsub")));

        let routed = mw.apply_before(EventKind::Route, Request::get("/x"));
        assert_eq!(routed.header("X-Trail"), Some("ab"));
        let http = mw.apply_before(EventKind::Http, Request::get("/"));
        assert_eq!(http.header("X-Trail"), Some("a"));
    }

    #[test]
    fn test_after_chain() {
        let mut mw = Middleware::default();
        mw.add_after(Selector::All, Arc::new(|r: Response| r.with_header("X-After", "1")));
        mw.add_after(Selector::Kind(EventKind::Schedule), Arc::new(|r: Response| r.with_status(202)));

        let resp = mw.apply_after(EventKind::Schedule, Response::from(json!("ok")));
        assert_eq!(resp.status, 202);
        assert_eq!(resp.headers["X-After"], "1");
        assert_eq!(mw.apply_after(EventKind::Http, Response::default()).status, 200);
    }
}
