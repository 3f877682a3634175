// Request, response and push shapes exchanged with the remote annotation store.

pub mod annotations;
pub mod response;
