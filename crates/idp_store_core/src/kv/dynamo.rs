//! DynamoDB client backed by the AWS SDK.
//!
//! # Responsibility
//! - Translate [`KvClient`] calls into SDK requests, paginating queries and
//!   scans.
//! - Drive the async SDK from synchronous callers on one private
//!   current-thread runtime.
//! - Map SDK failures onto [`KvError`].
//!
//! # Invariants
//! - Tables are created on demand with on-demand billing; an existing table
//!   counts as success.
//! - `create_table` returns only once the table reports `ACTIVE`, or fails
//!   with [`KvError::Unavailable`] after [`TABLE_ACTIVE_TIMEOUT`].
//! - Queries need the table schema registered through `create_table`.

use super::attribute::{AttributeValue, Item, HASH_KEY};
use super::client::{
    CancellationReason, Condition, KvClient, KvError, KvResult, TableDescription, TableSchema,
    WriteOp,
};
use crate::config::DynamoConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::create_table::CreateTableError;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue as SdkValue, BillingMode, ConditionCheck, Delete,
    GlobalSecondaryIndex, KeySchemaElement, KeyType, Projection, ProjectionType, Put,
    ScalarAttributeType, TransactWriteItem,
};
use aws_sdk_dynamodb::Client;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

type SdkItem = HashMap<String, SdkValue>;

/// Upper bound on waiting for a new table to leave `CREATING`.
pub const TABLE_ACTIVE_TIMEOUT: Duration = Duration::from_secs(60);
const TABLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TABLE_ACTIVE: &str = "ACTIVE";

pub struct DynamoDbClient {
    client: Client,
    runtime: Runtime,
    schemas: Mutex<HashMap<String, TableSchema>>,
}

impl DynamoDbClient {
    /// Builds the SDK client for `config.region`, honoring an endpoint
    /// override.
    pub fn connect(config: &DynamoConfig) -> KvResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| KvError::Unavailable(format!("runtime start failed: {err}")))?;

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = runtime.block_on(loader.load());
        info!(
            "event=kv_connect module=kv backend=dynamodb status=ok region={} endpoint_override={}",
            config.region,
            config.endpoint.is_some()
        );

        Ok(Self {
            client: Client::new(&sdk_config),
            runtime,
            schemas: Mutex::new(HashMap::new()),
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn wait_until_active(&self, table: &str) -> KvResult<()> {
        let started = Instant::now();
        poll_until_active(table, TABLE_ACTIVE_TIMEOUT, TABLE_POLL_INTERVAL, || {
            self.describe_table(table).map(|description| description.status)
        })?;
        info!(
            "event=table_active module=kv backend=dynamodb status=ok table={} duration_ms={}",
            table,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    fn partition_key(&self, table: &str, index: &str) -> KvResult<String> {
        self.schemas
            .lock()
            .get(table)
            .and_then(|schema| schema.index(index))
            .map(|index| index.partition_key.clone())
            .ok_or_else(|| {
                KvError::Validation(format!("{table}: index `{index}` is not registered"))
            })
    }
}

/// Polls `status` until it reports `ACTIVE`. A table that is still missing
/// right after `CreateTable` is treated as not yet visible.
fn poll_until_active<F>(
    table: &str,
    timeout: Duration,
    interval: Duration,
    mut status: F,
) -> KvResult<()>
where
    F: FnMut() -> KvResult<String>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let last = match status() {
            Ok(status) if status == TABLE_ACTIVE => return Ok(()),
            Ok(status) => status,
            Err(KvError::ResourceNotFound(_)) => "MISSING".to_string(),
            Err(err) => return Err(err),
        };
        if Instant::now() + interval > deadline {
            return Err(KvError::Unavailable(format!(
                "{table}: still {last} after {}ms",
                timeout.as_millis()
            )));
        }
        std::thread::sleep(interval);
    }
}

fn key_element(name: &str, key_type: KeyType) -> KvResult<KeySchemaElement> {
    KeySchemaElement::builder()
        .attribute_name(name)
        .key_type(key_type)
        .build()
        .map_err(|err| KvError::Validation(err.to_string()))
}

fn string_attribute(name: &str) -> KvResult<AttributeDefinition> {
    AttributeDefinition::builder()
        .attribute_name(name)
        .attribute_type(ScalarAttributeType::S)
        .build()
        .map_err(|err| KvError::Validation(err.to_string()))
}

fn to_sdk(value: AttributeValue) -> SdkValue {
    match value {
        AttributeValue::S(value) => SdkValue::S(value),
        AttributeValue::N(value) => SdkValue::N(value),
        AttributeValue::Bool(value) => SdkValue::Bool(value),
        AttributeValue::Null => SdkValue::Null(true),
        AttributeValue::M(map) => {
            SdkValue::M(map.into_iter().map(|(k, v)| (k, to_sdk(v))).collect())
        }
        AttributeValue::L(values) => SdkValue::L(values.into_iter().map(to_sdk).collect()),
    }
}

fn from_sdk(value: SdkValue) -> KvResult<AttributeValue> {
    Ok(match value {
        SdkValue::S(value) => AttributeValue::S(value),
        SdkValue::N(value) => AttributeValue::N(value),
        SdkValue::Bool(value) => AttributeValue::Bool(value),
        SdkValue::Null(_) => AttributeValue::Null,
        SdkValue::M(map) => AttributeValue::M(
            map.into_iter()
                .map(|(k, v)| from_sdk(v).map(|v| (k, v)))
                .collect::<KvResult<_>>()?,
        ),
        SdkValue::L(values) => {
            AttributeValue::L(values.into_iter().map(from_sdk).collect::<KvResult<_>>()?)
        }
        other => {
            return Err(KvError::Validation(format!(
                "unsupported attribute type: {other:?}"
            )))
        }
    })
}

fn item_to_sdk(item: Item) -> SdkItem {
    item.into_iter().map(|(k, v)| (k, to_sdk(v))).collect()
}

fn item_from_sdk(item: SdkItem) -> KvResult<Item> {
    item.into_iter()
        .map(|(k, v)| from_sdk(v).map(|v| (k, v)))
        .collect()
}

fn key_of(id: &str) -> SdkItem {
    HashMap::from([(HASH_KEY.to_string(), SdkValue::S(id.to_string()))])
}

/// Condition expression with its placeholder maps.
#[derive(Default)]
struct Expression {
    text: String,
    names: HashMap<String, String>,
    values: HashMap<String, SdkValue>,
}

impl Expression {
    fn render(condition: &Condition) -> Self {
        let mut expression = Self::default();
        let text = expression.push(condition);
        Self { text, ..expression }
    }

    fn name(&mut self, attribute: &str) -> String {
        let placeholder = format!("#a{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    fn push(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::AttributeExists(attribute) => {
                format!("attribute_exists({})", self.name(attribute))
            }
            Condition::AttributeNotExists(attribute) => {
                format!("attribute_not_exists({})", self.name(attribute))
            }
            Condition::Equals(attribute, value) => {
                let name = self.name(attribute);
                let placeholder = format!(":v{}", self.values.len());
                self.values.insert(placeholder.clone(), to_sdk(value.clone()));
                format!("{name} = {placeholder}")
            }
            Condition::Or(left, right) => {
                let left = self.push(left);
                let right = self.push(right);
                format!("({left}) OR ({right})")
            }
        }
    }

    fn values(&self) -> Option<HashMap<String, SdkValue>> {
        (!self.values.is_empty()).then(|| self.values.clone())
    }
}

fn map_sdk_error<E, R>(table: &str, err: SdkError<E, R>) -> KvError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    if matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
    ) {
        return KvError::Unavailable(DisplayErrorContext(&err).to_string());
    }
    let message = err.message().unwrap_or_default().to_string();
    match err.code() {
        Some(
            "ProvisionedThroughputExceededException"
            | "ThrottlingException"
            | "RequestLimitExceeded",
        ) => KvError::Throttled(message),
        Some("ConditionalCheckFailedException") => KvError::ConditionalCheckFailed {
            table: table.to_string(),
            id: String::new(),
        },
        Some("ResourceNotFoundException") => KvError::ResourceNotFound(table.to_string()),
        Some("ValidationException") => KvError::Validation(message),
        _ => KvError::Service(DisplayErrorContext(&err).to_string()),
    }
}

fn cancellation_reason(code: Option<&str>) -> CancellationReason {
    match code {
        None | Some("None") => CancellationReason::None,
        Some("ConditionalCheckFailed") => CancellationReason::ConditionalCheckFailed,
        Some("TransactionConflict") => CancellationReason::TransactionConflict,
        Some("ThrottlingError" | "ProvisionedThroughputExceeded") => {
            CancellationReason::Throttled
        }
        Some(other) => CancellationReason::Other(other.to_string()),
    }
}

fn transact_item(op: WriteOp) -> KvResult<TransactWriteItem> {
    let invalid = |err: aws_sdk_dynamodb::error::BuildError| KvError::Validation(err.to_string());
    let builder = TransactWriteItem::builder();
    Ok(match op {
        WriteOp::Put {
            table,
            item,
            condition,
        } => {
            let expression = condition.as_ref().map(Expression::render);
            let put = Put::builder()
                .table_name(table)
                .set_item(Some(item_to_sdk(item)))
                .set_condition_expression(expression.as_ref().map(|e| e.text.clone()))
                .set_expression_attribute_names(expression.as_ref().map(|e| e.names.clone()))
                .set_expression_attribute_values(expression.as_ref().and_then(Expression::values))
                .build()
                .map_err(invalid)?;
            builder.put(put).build()
        }
        WriteOp::Delete {
            table,
            id,
            condition,
        } => {
            let expression = condition.as_ref().map(Expression::render);
            let delete = Delete::builder()
                .table_name(table)
                .set_key(Some(key_of(&id)))
                .set_condition_expression(expression.as_ref().map(|e| e.text.clone()))
                .set_expression_attribute_names(expression.as_ref().map(|e| e.names.clone()))
                .set_expression_attribute_values(expression.as_ref().and_then(Expression::values))
                .build()
                .map_err(invalid)?;
            builder.delete(delete).build()
        }
        WriteOp::ConditionCheck {
            table,
            id,
            condition,
        } => {
            let expression = Expression::render(&condition);
            let values = expression.values();
            let check = ConditionCheck::builder()
                .table_name(table)
                .set_key(Some(key_of(&id)))
                .condition_expression(expression.text)
                .set_expression_attribute_names(Some(expression.names))
                .set_expression_attribute_values(values)
                .build()
                .map_err(invalid)?;
            builder.condition_check(check).build()
        }
    })
}

impl KvClient for DynamoDbClient {
    fn create_table(&self, schema: &TableSchema) -> KvResult<()> {
        self.schemas
            .lock()
            .insert(schema.name.clone(), schema.clone());

        let mut attributes = BTreeSet::from([HASH_KEY.to_string()]);
        let mut indexes = Vec::with_capacity(schema.indexes.len());
        for index in &schema.indexes {
            attributes.insert(index.partition_key.clone());
            let mut key_schema = vec![key_element(&index.partition_key, KeyType::Hash)?];
            if let Some(sort_key) = &index.sort_key {
                attributes.insert(sort_key.clone());
                key_schema.push(key_element(sort_key, KeyType::Range)?);
            }
            indexes.push(
                GlobalSecondaryIndex::builder()
                    .index_name(&index.name)
                    .set_key_schema(Some(key_schema))
                    .projection(
                        Projection::builder()
                            .projection_type(ProjectionType::All)
                            .build(),
                    )
                    .build()
                    .map_err(|err| KvError::Validation(err.to_string()))?,
            );
        }
        let definitions = attributes
            .iter()
            .map(|name| string_attribute(name))
            .collect::<KvResult<Vec<_>>>()?;

        let request = self
            .client
            .create_table()
            .table_name(&schema.name)
            .set_attribute_definitions(Some(definitions))
            .key_schema(key_element(HASH_KEY, KeyType::Hash)?)
            .set_global_secondary_indexes((!indexes.is_empty()).then_some(indexes))
            .billing_mode(BillingMode::PayPerRequest);
        match self.block_on(request.send()) {
            Ok(_) => {
                info!(
                    "event=table_create module=kv backend=dynamodb status=ok table={}",
                    schema.name
                );
                self.wait_until_active(&schema.name)
            }
            Err(err)
                if matches!(
                    err.as_service_error(),
                    Some(CreateTableError::ResourceInUseException(_))
                ) =>
            {
                debug!(
                    "event=table_create module=kv backend=dynamodb status=exists table={}",
                    schema.name
                );
                // Another process may have issued the create moments ago.
                self.wait_until_active(&schema.name)
            }
            Err(err) => Err(map_sdk_error(&schema.name, err)),
        }
    }

    fn describe_table(&self, table: &str) -> KvResult<TableDescription> {
        let output = self
            .block_on(self.client.describe_table().table_name(table).send())
            .map_err(|err| map_sdk_error(table, err))?;
        let description = output
            .table()
            .ok_or_else(|| KvError::ResourceNotFound(table.to_string()))?;
        Ok(TableDescription {
            name: table.to_string(),
            status: description
                .table_status()
                .map(|status| status.as_str().to_string())
                .unwrap_or_default(),
            item_count: description.item_count().unwrap_or_default().max(0) as u64,
        })
    }

    fn get_item(&self, table: &str, id: &str) -> KvResult<Option<Item>> {
        let output = self
            .block_on(
                self.client
                    .get_item()
                    .table_name(table)
                    .set_key(Some(key_of(id)))
                    .consistent_read(true)
                    .send(),
            )
            .map_err(|err| map_sdk_error(table, err))?;
        output.item().cloned().map(item_from_sdk).transpose()
    }

    fn query(&self, table: &str, index: &str, partition_value: &str) -> KvResult<Vec<Item>> {
        let partition_key = self.partition_key(table, index)?;
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .block_on(
                    self.client
                        .query()
                        .table_name(table)
                        .index_name(index)
                        .key_condition_expression("#pk = :pk")
                        .expression_attribute_names("#pk", &partition_key)
                        .expression_attribute_values(":pk", SdkValue::S(partition_value.to_string()))
                        .set_exclusive_start_key(start_key.take())
                        .send(),
                )
                .map_err(|err| map_sdk_error(table, err))?;
            for item in output.items() {
                items.push(item_from_sdk(item.clone())?);
            }
            match output.last_evaluated_key() {
                Some(key) => start_key = Some(key.clone()),
                None => return Ok(items),
            }
        }
    }

    fn scan(&self, table: &str) -> KvResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .block_on(
                    self.client
                        .scan()
                        .table_name(table)
                        .set_exclusive_start_key(start_key.take())
                        .send(),
                )
                .map_err(|err| map_sdk_error(table, err))?;
            for item in output.items() {
                items.push(item_from_sdk(item.clone())?);
            }
            match output.last_evaluated_key() {
                Some(key) => start_key = Some(key.clone()),
                None => return Ok(items),
            }
        }
    }

    fn put_item(&self, table: &str, item: Item, condition: Option<Condition>) -> KvResult<()> {
        let id = super::attribute::item_id(&item).unwrap_or_default().to_string();
        let expression = condition.as_ref().map(Expression::render);
        let request = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(item_to_sdk(item)))
            .set_condition_expression(expression.as_ref().map(|e| e.text.clone()))
            .set_expression_attribute_names(expression.as_ref().map(|e| e.names.clone()))
            .set_expression_attribute_values(expression.as_ref().and_then(Expression::values));
        self.block_on(request.send())
            .map(|_| ())
            .map_err(|err| match map_sdk_error(table, err) {
                KvError::ConditionalCheckFailed { table, .. } => {
                    KvError::ConditionalCheckFailed { table, id }
                }
                other => other,
            })
    }

    fn delete_item(&self, table: &str, id: &str, condition: Option<Condition>) -> KvResult<()> {
        let expression = condition.as_ref().map(Expression::render);
        let request = self
            .client
            .delete_item()
            .table_name(table)
            .set_key(Some(key_of(id)))
            .set_condition_expression(expression.as_ref().map(|e| e.text.clone()))
            .set_expression_attribute_names(expression.as_ref().map(|e| e.names.clone()))
            .set_expression_attribute_values(expression.as_ref().and_then(Expression::values));
        self.block_on(request.send())
            .map(|_| ())
            .map_err(|err| match map_sdk_error(table, err) {
                KvError::ConditionalCheckFailed { table, .. } => KvError::ConditionalCheckFailed {
                    table,
                    id: id.to_string(),
                },
                other => other,
            })
    }

    fn transact_write(&self, ops: Vec<WriteOp>) -> KvResult<()> {
        let first_table = ops
            .first()
            .and_then(WriteOp::target)
            .map(|(table, _)| table.to_string())
            .unwrap_or_default();
        let items = ops
            .into_iter()
            .map(transact_item)
            .collect::<KvResult<Vec<_>>>()?;
        let result = self.block_on(
            self.client
                .transact_write_items()
                .set_transact_items(Some(items))
                .send(),
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(TransactWriteItemsError::TransactionCanceledException(canceled)) =
                    err.as_service_error()
                {
                    return Err(KvError::TransactionCanceled {
                        reasons: canceled
                            .cancellation_reasons()
                            .iter()
                            .map(|reason| cancellation_reason(reason.code()))
                            .collect(),
                    });
                }
                Err(map_sdk_error(&first_table, err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{cancellation_reason, poll_until_active, Expression};
    use crate::kv::attribute::AttributeValue;
    use crate::kv::client::{CancellationReason, Condition, KvError};
    use std::time::Duration;

    #[test]
    fn guard_condition_renders_placeholders() {
        let condition = Condition::or(
            Condition::AttributeNotExists("id".to_string()),
            Condition::Equals("ownerId".to_string(), AttributeValue::S("a".to_string())),
        );
        let expression = Expression::render(&condition);
        assert_eq!(
            expression.text,
            "(attribute_not_exists(#a0)) OR (#a1 = :v0)"
        );
        assert_eq!(expression.names["#a1"], "ownerId");
        assert_eq!(expression.values.len(), 1);
    }

    #[test]
    fn cancellation_codes_map_to_reasons() {
        assert_eq!(cancellation_reason(Some("None")), CancellationReason::None);
        assert_eq!(
            cancellation_reason(Some("ThrottlingError")),
            CancellationReason::Throttled
        );
        assert_eq!(
            cancellation_reason(Some("ItemCollectionSizeLimitExceeded")),
            CancellationReason::Other("ItemCollectionSizeLimitExceeded".to_string())
        );
    }

    #[test]
    fn table_wait_returns_once_status_turns_active() {
        let mut statuses = vec![
            Ok("ACTIVE".to_string()),
            Ok("CREATING".to_string()),
            Err(KvError::ResourceNotFound("t".to_string())),
        ];
        let mut calls = 0;
        poll_until_active("t", Duration::from_secs(1), Duration::from_millis(1), || {
            calls += 1;
            statuses.pop().expect("status")
        })
        .expect("table becomes active");
        assert_eq!(calls, 3);
    }

    #[test]
    fn table_wait_gives_up_after_the_deadline() {
        let err = poll_until_active("t", Duration::from_millis(20), Duration::from_millis(5), || {
            Ok("CREATING".to_string())
        })
        .expect_err("never active");
        assert!(
            matches!(&err, KvError::Unavailable(message) if message.contains("CREATING")),
            "{err:?}"
        );
    }

    #[test]
    fn table_wait_surfaces_other_failures() {
        let err = poll_until_active("t", Duration::from_secs(1), Duration::from_millis(1), || {
            Err(KvError::Throttled("slow down".to_string()))
        })
        .expect_err("throttled");
        assert!(matches!(err, KvError::Throttled(_)), "{err:?}");
    }
}
