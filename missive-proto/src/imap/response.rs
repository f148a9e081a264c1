use anyhow::Result;
use missive_codec::imap::response::{Code, Data, StatusKind, StatusResponse};
use missive_codec::imap::types::Command;

/// One element of a response body: either untagged data or an untagged
/// status line (e.g. `* OK [UIDVALIDITY 42] UIDs valid`).
#[derive(Clone, Debug)]
pub enum Body {
    Data(Data),
    Status(StatusResponse),
}

impl Body {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Body::Data(data) => data.encode(out),
            Body::Status(status) => status.encode(out),
        }
    }
}

pub struct ResponseBuilder {
    status: StatusKind,
    tag: Option<String>,
    code: Option<Code>,
    text: String,
    data: Vec<Body>,
}

impl Default for ResponseBuilder {
    fn default() -> ResponseBuilder {
        ResponseBuilder {
            status: StatusKind::Bad,
            tag: None,
            code: None,
            text: String::new(),
            data: vec![],
        }
    }
}

impl ResponseBuilder {
    pub fn to_req(mut self, cmd: &Command) -> Self {
        self.tag = Some(cmd.tag.0.clone());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn message(mut self, txt: impl Into<String>) -> Self {
        self.text = txt.into();
        self
    }

    pub fn code(mut self, code: Code) -> Self {
        self.code = Some(code);
        self
    }

    pub fn data(mut self, data: Data) -> Self {
        self.data.push(Body::Data(data));
        self
    }

    pub fn set_body(mut self, data: Vec<Body>) -> Self {
        self.data = data;
        self
    }

    pub fn ok(self) -> Result<Response> {
        self.kind(StatusKind::Ok)
    }

    pub fn no(self) -> Result<Response> {
        self.kind(StatusKind::No)
    }

    pub fn bad(self) -> Result<Response> {
        self.kind(StatusKind::Bad)
    }

    fn kind(self, kind: StatusKind) -> Result<Response> {
        Ok(Response {
            completion: StatusResponse {
                tag: self.tag,
                kind,
                code: self.code,
                text: self.text,
            },
            body: self.data,
        })
    }
}

/// One command's full answer: untagged data first, the tagged (or BYE)
/// completion line last.
pub struct Response {
    pub body: Vec<Body>,
    pub completion: StatusResponse,
}

impl Response {
    pub fn build() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    pub fn bye(text: impl Into<String>) -> Response {
        Response {
            body: vec![],
            completion: StatusResponse::untagged(StatusKind::Bye, None, text.into()),
        }
    }

    /// Serialize; untagged responses always precede the completion line.
    pub fn encode(&self, out: &mut Vec<u8>) {
        for body in &self.body {
            body.encode(out);
        }
        self.completion.encode(out);
    }
}
