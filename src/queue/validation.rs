//! Payload validation on enqueue.
//!
//! Validators run before anything is written; a rejected payload surfaces as
//! [`QueueError::Validation`](crate::error::QueueError::Validation) and is
//! never stored.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Checks a payload, returning every problem found.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), Vec<String>>;
}

/// Accepts payloads that deserialize into `T`.
pub struct SchemaValidator<T> {
    _schema: PhantomData<fn() -> T>,
}

impl<T> SchemaValidator<T> {
    pub fn new() -> Self {
        Self {
            _schema: PhantomData,
        }
    }
}

impl<T> Default for SchemaValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SchemaValidator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("schema", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: DeserializeOwned> PayloadValidator for SchemaValidator<T> {
    fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
        T::deserialize(payload)
            .map(|_| ())
            .map_err(|e| vec![e.to_string()])
    }
}

/// Wraps a closure as a validator.
pub struct FnValidator<F>(F);

impl<F> FnValidator<F>
where
    F: Fn(&Value) -> Result<(), Vec<String>> + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self(check)
    }
}

impl<F> PayloadValidator for FnValidator<F>
where
    F: Fn(&Value) -> Result<(), Vec<String>> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
        (self.0)(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Email {
        to: String,
        subject: String,
    }

    #[test]
    fn test_schema_validator() {
        let validator = SchemaValidator::<Email>::new();
        assert!(validator
            .validate(&json!({"to": "a@b.c", "subject": "hi"}))
            .is_ok());

        let errors = validator
            .validate(&json!({"to": "a@b.c"}))
            .expect_err("missing subject");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("subject"));
    }

    #[test]
    fn test_fn_validator() {
        let validator = FnValidator::new(|payload: &Value| {
            if payload.is_object() {
                Ok(())
            } else {
                Err(vec!["payload must be an object".to_string()])
            }
        });
        assert!(validator.validate(&json!({})).is_ok());
        assert!(validator.validate(&json!(3)).is_err());
    }
}
