//! Ordered request routing.
//!
//! Routes are tried in registration order. A pattern is made of literal
//! segments, `:name` parameters matching exactly one non-empty segment, and an
//! optional trailing `*` matching whatever is left. A handler that sets the
//! request's yield flag passes the request on to the next matching route; when
//! no route keeps it the router answers `404 Not Found` with an empty body.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use http::Method;
use micro_engine::protocol::RouteParams;
use micro_engine::{HttpHandler, HttpRequest, HttpResponse};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(Box<str>),
    Param(Rc<str>),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    source: Box<str>,
    segments: Vec<Segment>,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Pattern {
    fn parse(source: &str) -> Self {
        let trimmed = source.strip_prefix('/').unwrap_or(source);
        let mut segments = Vec::new();
        for part in trimmed.split('/') {
            if part == "*" {
                segments.push(Segment::Wildcard);
                break;
            }
            match part.strip_prefix(':') {
                Some(name) => segments.push(Segment::Param(Rc::from(name))),
                None => segments.push(Segment::Literal(Box::from(part))),
            }
        }
        if segments.last() == Some(&Segment::Wildcard) && !trimmed.ends_with('*') {
            debug!(pattern = source, "segments after `*` are ignored");
        }
        Self { source: Box::from(source), segments }
    }

    /// Matches `path`, collecting parameters as ranges into it.
    fn matches(&self, path: &str, params: &mut RouteParams) -> bool {
        params.clear();
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut parts = trimmed.split('/').scan(path.len() - trimmed.len(), |offset, part| {
            let start = *offset;
            *offset += part.len() + 1;
            Some((start, part))
        });

        for segment in &self.segments {
            match segment {
                Segment::Wildcard => return true,
                Segment::Literal(literal) => match parts.next() {
                    Some((_, part)) if part == &**literal => {}
                    _ => return false,
                },
                Segment::Param(name) => match parts.next() {
                    Some((start, part)) if !part.is_empty() => params.push(Rc::clone(name), start..start + part.len()),
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

struct Route {
    /// `None` matches any method
    method: Option<Method>,
    pattern: Pattern,
    handler: Box<dyn HttpHandler>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route").field("method", &self.method).field("pattern", &self.pattern.source).finish_non_exhaustive()
    }
}

impl Route {
    fn accepts(&self, method: &Method) -> bool {
        self.method.as_ref().is_none_or(|expected| expected == method)
    }
}

/// The route table of an app, itself the [`HttpHandler`] every connection dispatches to.
///
/// Routes can be added while the app is serving: a dispatch in progress keeps
/// working on the table it started with.
#[derive(Debug, Default)]
pub struct Router {
    routes: RefCell<Rc<Vec<Rc<Route>>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a route, `method: None` registers it for every method.
    pub fn register<H>(&self, method: Option<Method>, pattern: &str, handler: H)
    where
        H: HttpHandler + 'static,
    {
        let route = Route { method, pattern: Pattern::parse(pattern), handler: Box::new(handler) };
        trace!(?route, "register route");
        Rc::make_mut(&mut self.routes.borrow_mut()).push(Rc::new(route));
    }

    pub fn len(&self) -> usize {
        self.routes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.borrow().is_empty()
    }
}

impl HttpHandler for Router {
    fn handle(&self, res: HttpResponse, req: &mut HttpRequest<'_>) {
        let routes = Rc::clone(&self.routes.borrow());
        let method = req.method();
        let path = req.url();

        let mut params = RouteParams::new();
        for route in routes.iter() {
            if !route.accepts(method) || !route.pattern.matches(path, &mut params) {
                continue;
            }

            req.set_parameters(std::mem::take(&mut params));
            req.set_yield(false);
            route.handler.handle(res.clone(), req);
            if !req.get_yield() {
                return;
            }
            trace!(pattern = %route.pattern, path, "route yielded");
        }

        not_found(&res);
    }
}

fn not_found(res: &HttpResponse) {
    if let Err(e) = res.write_status("404 Not Found").and_then(|res| res.end(b"", false)) {
        debug!(cause = %e, "can't answer with 404");
    }
}
