use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use overbook_core::repository::{BookingQueue, Delivery, QueueConsumer, QueueError};
use overbook_core::{BookingRequest, FlightId};

fn connection(e: KafkaError) -> QueueError {
    QueueError::Connection(e.to_string())
}

/// Per-flight request queue: one topic per flight, one consumer group per
/// flight, offsets committed by hand after the booking record is durable.
#[derive(Clone)]
pub struct KafkaBookingQueue {
    brokers: String,
    topic_prefix: String,
    group_prefix: String,
    producer: FutureProducer,
}

impl KafkaBookingQueue {
    pub fn new(brokers: &str, topic_prefix: &str, group_prefix: &str) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()?;

        Ok(Self {
            brokers: brokers.to_string(),
            topic_prefix: topic_prefix.to_string(),
            group_prefix: group_prefix.to_string(),
            producer,
        })
    }

    pub fn topic_for(&self, flight_id: FlightId) -> String {
        format!("{}.{}", self.topic_prefix, flight_id)
    }

    fn group_for(&self, flight_id: FlightId) -> String {
        format!("{}.{}", self.group_prefix, flight_id)
    }
}

#[async_trait]
impl BookingQueue for KafkaBookingQueue {
    async fn enqueue(&self, flight_id: FlightId, request: &BookingRequest) -> Result<(), QueueError> {
        let topic = self.topic_for(flight_id);
        let key = request.booking_id.to_string();
        let payload = request
            .to_payload()
            .map_err(|e| QueueError::Payload(e.to_string()))?;

        let record = FutureRecord::to(&topic).key(&key).payload(&payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(5))).await {
            Ok(delivery) => {
                info!(
                    "Sent booking {} to {}: partition {} offset {}",
                    key, topic, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send booking {} to {}: {}", key, topic, e);
                Err(connection(e))
            }
        }
    }

    async fn consumer(&self, flight_id: FlightId) -> Result<Box<dyn QueueConsumer>, QueueError> {
        let topic = self.topic_for(flight_id);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", self.group_for(flight_id))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("allow.auto.create.topics", "true")
            .create()
            .map_err(connection)?;

        consumer.subscribe(&[topic.as_str()]).map_err(connection)?;
        info!("Subscribed to {} for flight {}", topic, flight_id);

        Ok(Box::new(KafkaQueueConsumer {
            consumer: Arc::new(consumer),
            topic,
        }))
    }
}

/// Position to commit so that `offset` counts as consumed.
fn commit_position(topic: &str, partition: i32, offset: i64) -> Result<TopicPartitionList, KafkaError> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
    Ok(tpl)
}

pub struct KafkaQueueConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaQueueConsumer {
    /// Runs a blocking librdkafka call off the async workers.
    async fn blocking<T, F>(&self, call: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&StreamConsumer, &str) -> Result<T, KafkaError> + Send + 'static,
    {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || call(&consumer, &topic))
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?
            .map_err(connection)
    }

    async fn commit_through(&self, partition: i32, offset: i64) -> Result<(), QueueError> {
        self.blocking(move |consumer, topic| {
            let tpl = commit_position(topic, partition, offset)?;
            consumer.commit(&tpl, CommitMode::Sync)
        })
        .await
    }
}

#[async_trait]
impl QueueConsumer for KafkaQueueConsumer {
    async fn dequeue(&mut self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let message = match tokio::time::timeout(wait, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(connection(e)),
            Ok(Ok(message)) => message,
        };

        let partition = message.partition();
        let offset = message.offset();
        let decoded = match message.payload() {
            Some(bytes) => BookingRequest::from_payload(bytes).map_err(|e| e.to_string()),
            None => Err("empty payload".to_string()),
        };
        drop(message);

        match decoded {
            Ok(request) => Ok(Some(Delivery {
                request,
                partition,
                offset,
            })),
            Err(reason) => {
                // A payload that cannot be decoded never will be; commit past it.
                if let Err(e) = self.commit_through(partition, offset).await {
                    warn!("Failed to commit past malformed message at {}/{}: {}", partition, offset, e);
                }
                Err(QueueError::Payload(format!("{} at {}/{}", reason, partition, offset)))
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        self.commit_through(delivery.partition, delivery.offset).await
    }

    async fn requeue(&mut self, delivery: Delivery) -> Result<(), QueueError> {
        // Rewind so the next fetch, or the next group member, sees it again.
        self.blocking(move |consumer, topic| {
            consumer.seek(
                topic,
                delivery.partition,
                Offset::Offset(delivery.offset),
                Timeout::After(Duration::from_secs(5)),
            )
        })
        .await
    }
}
