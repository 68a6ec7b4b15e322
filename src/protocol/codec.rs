use prost::Message as _;

use super::messages::{Message, MessageType, Request, RequestType, Response};
use crate::error::ProtocolError;

/// Serialize one envelope into the payload of a binary WebSocket message.
pub fn encode(message: &Message) -> Vec<u8> {
    message.encode_to_vec()
}

pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    Ok(Message::decode(data)?)
}

pub fn keepalive() -> Message {
    Message {
        r#type: Some(MessageType::Keepalive as i32),
        request: None,
        response: None,
    }
}

/// Wrap `request` into a REQUEST envelope, stamping its id and type.
pub fn request_message(id: i32, request_type: RequestType, mut request: Request) -> Message {
    request.id = Some(id);
    request.r#type = Some(request_type as i32);
    Message {
        r#type: Some(MessageType::Request as i32),
        request: Some(request),
        response: None,
    }
}

pub fn response_message(response: Response) -> Message {
    Message {
        r#type: Some(MessageType::Response as i32),
        request: None,
        response: Some(response),
    }
}

pub fn is_keepalive(message: &Message) -> bool {
    message.r#type == Some(MessageType::Keepalive as i32)
}

/// Short description for log lines
pub fn describe(message: &Message) -> String {
    match (MessageType::try_from(message.r#type.unwrap_or_default()), &message.request, &message.response) {
        (Ok(MessageType::Request), Some(req), _) => {
            format!("REQUEST id={} type={:?}", req.id(), req.r#type())
        }
        (Ok(MessageType::Response), _, Some(res)) => format!(
            "RESPONSE request_id={} type={:?} status={:?}",
            res.request_id(),
            res.request_type(),
            res.status_code
        ),
        (Ok(kind), _, _) => format!("{:?}", kind),
        (Err(_), _, _) => format!("UNKNOWN({:?})", message.r#type),
    }
}
