use std::fmt;

use crate::protocol::HttpRequest;
use crate::response::HttpResponse;

/// Entry point of every request a connection decodes.
///
/// Handlers are synchronous. Anything that outlives the call keeps the
/// [`HttpResponse`] (or its token) and finishes it later, the request view
/// is only valid during the call.
pub trait HttpHandler {
    fn handle(&self, res: HttpResponse, req: &mut HttpRequest<'_>);
}

pub struct HandlerFn<F> {
    f: F,
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

impl<F> HttpHandler for HandlerFn<F>
where
    F: Fn(HttpResponse, &mut HttpRequest<'_>),
{
    fn handle(&self, res: HttpResponse, req: &mut HttpRequest<'_>) {
        (self.f)(res, req)
    }
}

pub fn make_handler<F>(f: F) -> HandlerFn<F>
where
    F: Fn(HttpResponse, &mut HttpRequest<'_>),
{
    HandlerFn { f }
}
