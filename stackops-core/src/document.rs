//! Template documents.
//!
//! A template is a [`serde_json::Value`]: ordered maps, lists and scalars.
//! Templates are usually written as YAML, where intrinsic functions have a
//! short tag form (`!Ref Bucket`). Those tags are rewritten to the long form
//! (`{"Ref": "Bucket"}`) on load, so the rest of the pipeline only ever sees
//! plain maps.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Number, Value};
use serde_yaml::value::TaggedValue;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("could not parse document as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not parse document as YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported YAML value: {0}")]
    Unsupported(String),
}

/// Parse a template body. JSON is tried when the body looks like a JSON
/// object; everything else goes through the YAML reader.
pub fn parse_document(body: &str) -> Result<Value, DocumentError> {
    if body.trim_start().starts_with('{') {
        return Ok(serde_json::from_str(body)?);
    }
    let yaml: serde_yaml::Value = serde_yaml::from_str(body)?;
    yaml_to_document(yaml)
}

pub fn load_document(path: &Path) -> Result<Value> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_document(&body).with_context(|| format!("parsing {}", path.display()))
}

/// Render a template the way it is submitted to the stack service.
pub fn render_yaml(document: &Value) -> Result<String, DocumentError> {
    Ok(serde_yaml::to_string(document)?)
}

pub fn yaml_to_document(yaml: serde_yaml::Value) -> Result<Value, DocumentError> {
    Ok(match yaml {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => Value::Number(yaml_number(&n)?),
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_document)
                .collect::<Result<_, _>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (k, v) in mapping {
                map.insert(yaml_key(k)?, yaml_to_document(v)?);
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => intrinsic(*tagged)?,
    })
}

fn yaml_number(n: &serde_yaml::Number) -> Result<Number, DocumentError> {
    if let Some(i) = n.as_i64() {
        Ok(i.into())
    } else if let Some(u) = n.as_u64() {
        Ok(u.into())
    } else {
        n.as_f64()
            .and_then(Number::from_f64)
            .ok_or_else(|| DocumentError::Unsupported(format!("number {}", n)))
    }
}

fn yaml_key(key: serde_yaml::Value) -> Result<String, DocumentError> {
    match key {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(DocumentError::Unsupported(format!(
            "non-scalar mapping key {:?}",
            other
        ))),
    }
}

/// `!Ref x` becomes `{"Ref": x}`, `!Condition x` becomes `{"Condition": x}`
/// and any other `!Name x` becomes `{"Fn::Name": x}`. The scalar form of
/// `!GetAtt Resource.Attribute` is split into its two-element list form.
fn intrinsic(tagged: TaggedValue) -> Result<Value, DocumentError> {
    let tag = tagged.tag.to_string();
    let name = tag.trim_start_matches('!');
    if name.is_empty() {
        return Err(DocumentError::Unsupported(format!("tag {:?}", tag)));
    }
    let key = match name {
        "Ref" | "Condition" => name.to_string(),
        _ => format!("Fn::{}", name),
    };
    let value = match (name, yaml_to_document(tagged.value)?) {
        ("GetAtt", Value::String(s)) => match s.split_once('.') {
            Some((resource, attribute)) => Value::Array(vec![
                Value::String(resource.to_string()),
                Value::String(attribute.to_string()),
            ]),
            None => Value::String(s),
        },
        (_, value) => value,
    };
    let mut map = Map::new();
    map.insert(key, value);
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_json_bodies() {
        let doc = parse_document(r#"{"Resources": {"A": {"Type": "X"}}}"#).unwrap();
        assert_eq!(doc, json!({"Resources": {"A": {"Type": "X"}}}));
    }

    #[test]
    fn rewrites_short_form_intrinsics() {
        let doc = parse_document(
            r#"
Resources:
  Bucket:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: !Sub "${AWS::StackName}-assets"
      Tags:
        - Key: owner
          Value: !Ref Owner
      Arn: !GetAtt Role.Arn
"#,
        )
        .unwrap();
        assert_eq!(
            doc["Resources"]["Bucket"]["Properties"],
            json!({
                "BucketName": {"Fn::Sub": "${AWS::StackName}-assets"},
                "Tags": [{"Key": "owner", "Value": {"Ref": "Owner"}}],
                "Arn": {"Fn::GetAtt": ["Role", "Arn"]},
            })
        );
    }

    #[test]
    fn keeps_key_order() {
        let doc = parse_document("b: 1\na: 2\nc: 3\n").unwrap();
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn renders_yaml() {
        let body = render_yaml(&json!({"Resources": {"A": {"Type": "X"}}})).unwrap();
        assert_eq!(parse_document(&body).unwrap(), json!({"Resources": {"A": {"Type": "X"}}}));
    }
}
