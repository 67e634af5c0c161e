//! Cloud resources that are not tied to a trigger. Each may contribute an
//! [`InfraConfig`](crate::resource::InfraConfig) the backend folds into its
//! own configuration before deploying.
//!
//! | Infrastructure   | Cloud resource                        | Backend config            |
//! |------------------|---------------------------------------|---------------------------|
//! | `pubsub_topic`   | topic (+ `-dlq` topic and pull sub)   | none                      |
//! | `redis`          | Memorystore instance                  | `REDIS_*` env vars        |
//! | `vpc_connector`  | Serverless VPC connector              | `vpcConnector` + egress   |
//! | `cloudtask_queue`| Cloud Tasks queue                     | `CLOUDTASK_QUEUE_*` env   |
//! | `apigateway`     | API → API config → gateway            | none                      |
//! | `alerts`         | alert policies + logging metrics      | none                      |
//! | `bq_spark`       | spark connection, bucket, procedure   | none                      |

pub mod alerts;
pub mod apigateway;
pub mod bq_spark;
pub mod cloudtask_queue;
pub mod pubsub_topic;
pub mod redis;
pub mod vpc_connector;

pub use alerts::{Alert, AlertCondition, AlertTarget, Alerts, ConditionKind};
pub use apigateway::ApiGateway;
pub use bq_spark::{BqSparkStoredProcedure, SparkProcedureOptions};
pub use cloudtask_queue::{CloudTaskClient, CloudTaskQueue, TaskOptions};
pub use pubsub_topic::{PubSubClient, PubSubTopics};
pub use redis::Redis;
pub use vpc_connector::VpcConnector;
