use anyhow::Result;

use missive_codec::imap::response::{Data, StatusKind, StatusResponse};
use missive_codec::imap::types::Tag;

use crate::imap::capability::ServerCapability;
use crate::imap::flow;
use crate::imap::response::{Body, Response};

pub(crate) fn capability(
    tag: Tag,
    cap: &ServerCapability,
) -> Result<(Response, flow::Transition)> {
    let res = Response::build()
        .tag(tag.0)
        .message("Server capabilities")
        .data(Data::Capability(cap.to_vec()))
        .ok()?;
    Ok((res, flow::Transition::None))
}

pub(crate) fn id(tag: Tag) -> Result<(Response, flow::Transition)> {
    let res = Response::build()
        .tag(tag.0)
        .message("ID completed")
        .data(Data::Id(Some(vec![
            ("name".to_string(), "Missive".to_string()),
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ])))
        .ok()?;
    Ok((res, flow::Transition::None))
}

pub(crate) fn noop_nothing(tag: Tag) -> Result<(Response, flow::Transition)> {
    Ok((
        Response::build().tag(tag.0).message("Noop completed").ok()?,
        flow::Transition::None,
    ))
}

pub(crate) fn logout(tag: Tag) -> Result<(Response, flow::Transition)> {
    let res = Response::build()
        .tag(tag.0)
        .message("LOGOUT completed")
        .set_body(vec![Body::Status(StatusResponse::untagged(
            StatusKind::Bye,
            None,
            "Logging out",
        ))])
        .ok()?;
    Ok((res, flow::Transition::Logout))
}

pub(crate) fn wrong_state(tag: Tag) -> Result<(Response, flow::Transition)> {
    Ok((
        Response::build()
            .tag(tag.0)
            .message("Command not authorized in this state")
            .bad()?,
        flow::Transition::None,
    ))
}
