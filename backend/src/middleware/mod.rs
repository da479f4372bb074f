// Middleware for the Control Plane API
//
// The access log comes from tower-http's TraceLayer (wired in the router);
// the modules here cover the concerns that need the request-id envelope.

pub mod recover;
pub mod request_id;
pub mod timeout;
