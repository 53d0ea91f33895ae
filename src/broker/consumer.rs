//! Consumer-group member on a single topic. Workers and the
//! completion sink each own one, on `T_req` and `T_res` respectively.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::TopicPartitionList;

use super::Result;

/// An owned copy of a consumed message; rdkafka's borrowed messages
/// don't outlive the poll, which doesn't fit a pipeline that hands
/// work off to a worker-pool slot.
pub struct ConsumedMessage {
    pub key: String,
    pub payload: Vec<u8>,
    partition: i32,
    offset: i64,
}

pub struct BrokerConsumer {
    consumer: StreamConsumer,
}

impl BrokerConsumer {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(Self { consumer })
    }

    /// Waits for the next message. Malformed keys/payloads are still
    /// handed back as raw bytes, decoding is the caller's job so it
    /// can log-and-skip per message without losing the ability to
    /// commit past it.
    pub async fn recv(&self) -> Result<ConsumedMessage> {
        let msg = self.consumer.recv().await?;
        let key = msg.key().map(String::from_utf8_lossy).unwrap_or_default().into_owned();
        let payload = msg.payload().unwrap_or_default().to_vec();
        Ok(ConsumedMessage {
            key,
            payload,
            partition: msg.partition(),
            offset: msg.offset(),
        })
    }

    /// Commits past `message`. Called immediately after the work is
    /// enqueued (`Worker`) or after the completion side effect lands
    /// (`CompletionSink`): each caller picks its own offset policy.
    pub fn commit(&self, message: &ConsumedMessage) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            self.consumer.subscription()?.elements().first().map(|e| e.topic()).unwrap_or(""),
            message.partition,
            rdkafka::Offset::Offset(message.offset + 1),
        )?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }
}
