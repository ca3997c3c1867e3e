use crate::{error::Error, message::Message};

/// Turns envelopes into the text stored in the `content` column and back.
pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, message: &Message) -> Result<String, Error>;

    fn deserialize(&self, content: &str) -> Result<Message, Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> Result<String, Error> {
        Ok(serde_json::to_string(message)?)
    }

    fn deserialize(&self, content: &str) -> Result<Message, Error> {
        Ok(serde_json::from_str(content)?)
    }
}
