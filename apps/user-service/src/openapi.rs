//! # OpenAPI 契約
//!
//! 埋め込みの OpenAPI 定義（`api/openapi.yaml`）を `oas3` で読み込み、
//! リクエストをオペレーション単位で検証する。
//!
//! ## 検証内容
//!
//! - メソッドとパス（ベースパスを除いたもの）に一致するオペレーションがあること
//! - パスパラメーター・クエリパラメーターがスキーマを満たすこと
//! - JSON リクエストボディがスキーマを満たすこと
//!
//! パラメーターとボディの参照は `ObjectOrReference::resolve` で解決し、
//! スキーマ内の `$ref` は `components.schemas` から展開する。
//! スキーマは起動時に一度だけコンパイルし、リクエストでは `readOnly` の
//! プロパティを必須扱いしない。

use std::collections::HashMap;

use axum::http::Method;
use jsonschema::Validator;
use oas3::{
    OpenApiV3Spec,
    spec::{ObjectOrReference, ObjectSchema, ParameterIn},
};
use serde_json::Value;
use thiserror::Error;

/// 埋め込みの OpenAPI 定義
pub const OPENAPI_DOCUMENT: &str = include_str!("../api/openapi.yaml");

/// `$ref` 展開の最大深さ（循環参照の検出用）
const MAX_REF_DEPTH: usize = 32;

const SCHEMA_REF_PREFIX: &str = "#/components/schemas/";

/// 契約の読み込みエラー
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("OpenAPI 定義を解析できません: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("OpenAPI 定義が不正です: {0}")]
    Invalid(String),

    #[error("参照 {0} を解決できません")]
    UnresolvedRef(String),

    #[error("{location} のスキーマをコンパイルできません: {message}")]
    Schema { location: String, message: String },
}

/// リクエストの契約違反
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// 一致するオペレーションが無い
    NotFound(String),
    /// パラメーターまたはボディがスキーマを満たさない
    BadRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterLocation {
    Path,
    Query,
}

impl ParameterLocation {
    /// パス・クエリ以外（ヘッダー・クッキー）は検証対象外
    fn from_oas(location: ParameterIn) -> Option<Self> {
        match location {
            ParameterIn::Path => Some(Self::Path),
            ParameterIn::Query => Some(Self::Query),
            ParameterIn::Header | ParameterIn::Cookie => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct Parameter {
    name:      String,
    location:  ParameterLocation,
    required:  bool,
    schema:    Value,
    validator: Validator,
}

struct RequestBody {
    required:  bool,
    validator: Validator,
}

struct Operation {
    id:         String,
    method:     Method,
    template:   String,
    segments:   Vec<Segment>,
    parameters: Vec<Parameter>,
    body:       Option<RequestBody>,
}

impl Operation {
    fn param_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Param(_)))
            .count()
    }

    /// パスが一致すればパスパラメーターの値を返す
    fn match_path<'a>(&'a self, segments: &[&'a str]) -> Option<HashMap<&'a str, &'a str>> {
        if segments.len() != self.segments.len() {
            return None;
        }

        let mut values = HashMap::new();
        for (template, actual) in self.segments.iter().zip(segments) {
            match template {
                Segment::Literal(literal) if literal.as_str() == *actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if actual.is_empty() => return None,
                Segment::Param(name) => {
                    values.insert(name.as_str(), *actual);
                }
            }
        }
        Some(values)
    }
}

/// コンパイル済みの API 契約
pub struct ApiContract {
    base_path:  String,
    operations: Vec<Operation>,
}

impl ApiContract {
    /// 埋め込みの OpenAPI 定義から契約を構築する
    pub fn embedded(base_path: &str) -> Result<Self, ContractError> {
        Self::from_yaml(OPENAPI_DOCUMENT, base_path)
    }

    /// YAML の OpenAPI 定義から契約を構築する
    ///
    /// `base_path` はリクエストパスから取り除くプレフィックス（空文字列可）。
    pub fn from_yaml(document: &str, base_path: &str) -> Result<Self, ContractError> {
        let spec: OpenApiV3Spec = serde_yaml::from_str(document)?;

        let paths = spec
            .paths
            .as_ref()
            .ok_or_else(|| ContractError::Invalid("paths がありません".to_string()))?;

        let mut operations = Vec::new();
        for (template, item) in paths {
            for (method, operation) in item.methods() {
                operations.push(compile_operation(
                    &spec,
                    template,
                    method.clone(),
                    operation,
                    &item.parameters,
                )?);
            }
        }

        // リテラルのセグメントを優先してマッチさせる
        operations.sort_by_key(Operation::param_count);

        Ok(Self {
            base_path: base_path.trim_end_matches('/').to_string(),
            operations,
        })
    }

    /// 定義されているオペレーション ID の一覧
    pub fn operation_ids(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().map(|operation| operation.id.as_str())
    }

    /// メソッドとリクエストパスに一致するオペレーションを探す
    pub fn match_operation(
        &self,
        method: &Method,
        path: &str,
    ) -> Result<MatchedOperation<'_>, Violation> {
        let not_found = || Violation::NotFound(format!("{method} {path} に対応する操作がありません"));

        let relative = if self.base_path.is_empty() {
            path
        } else {
            path.strip_prefix(self.base_path.as_str())
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .ok_or_else(not_found)?
        };
        let segments: Vec<&str> = relative.trim_start_matches('/').split('/').collect();

        self.operations
            .iter()
            .filter(|operation| operation.method == *method)
            .find_map(|operation| {
                operation
                    .match_path(&segments)
                    .map(|values| (operation, values))
            })
            .map(|(operation, values)| MatchedOperation {
                operation,
                path_values: values
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
            })
            .ok_or_else(not_found)
    }
}

/// リクエストに一致したオペレーション
pub struct MatchedOperation<'a> {
    operation:   &'a Operation,
    path_values: HashMap<String, String>,
}

impl MatchedOperation<'_> {
    pub fn operation_id(&self) -> &str {
        &self.operation.id
    }

    /// パステンプレート（例: `/users/{userid}`）
    #[cfg(test)]
    fn template(&self) -> &str {
        &self.operation.template
    }

    /// リクエストボディの定義があるか
    pub fn expects_body(&self) -> bool {
        self.operation.body.is_some()
    }

    /// パスパラメーターとクエリパラメーターを検証する
    pub fn validate_parameters(&self, query: Option<&str>) -> Result<(), Violation> {
        let query_values: HashMap<String, String> = query
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .fold(HashMap::new(), |mut values, (key, value)| {
                        values.entry(key).or_insert(value);
                        values
                    })
            })
            .unwrap_or_default();

        for parameter in &self.operation.parameters {
            let raw = match parameter.location {
                ParameterLocation::Path => self.path_values.get(&parameter.name),
                ParameterLocation::Query => query_values.get(&parameter.name),
            };

            let Some(raw) = raw else {
                if parameter.required {
                    return Err(Violation::BadRequest(format!(
                        "必須パラメーター {} がありません",
                        parameter.name
                    )));
                }
                continue;
            };

            let instance = coerce(raw, &parameter.schema);
            check(
                &parameter.validator,
                &instance,
                &format!("パラメーター {}", parameter.name),
            )?;
        }

        Ok(())
    }

    /// リクエストボディを検証する
    ///
    /// ボディの定義が無いオペレーションでは何もしない。
    pub fn validate_body(&self, content_type: Option<&str>, body: &[u8]) -> Result<(), Violation> {
        let Some(definition) = &self.operation.body else {
            return Ok(());
        };

        if body.is_empty() {
            if definition.required {
                return Err(Violation::BadRequest(
                    "リクエストボディは必須です".to_string(),
                ));
            }
            return Ok(());
        }

        let is_json = content_type
            .and_then(|value| value.split(';').next())
            .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"));
        if !is_json {
            return Err(Violation::BadRequest(format!(
                "Content-Type は application/json である必要があります: {}",
                content_type.unwrap_or("(なし)")
            )));
        }

        let instance: Value = serde_json::from_slice(body).map_err(|e| {
            Violation::BadRequest(format!("リクエストボディが JSON として不正です: {e}"))
        })?;
        check(&definition.validator, &instance, "リクエストボディ")
    }
}

fn check(validator: &Validator, instance: &Value, location: &str) -> Result<(), Violation> {
    let messages: Vec<String> = validator
        .iter_errors(instance)
        .map(|error| error.to_string())
        .collect();

    if messages.is_empty() {
        Ok(())
    } else {
        Err(Violation::BadRequest(format!(
            "{location}が不正です: {}",
            messages.join("; ")
        )))
    }
}

/// 文字列のパラメーター値をスキーマの型に合わせて変換する
///
/// 変換できない値は文字列のまま残し、スキーマ検証でエラーにする。
fn coerce(raw: &str, schema: &Value) -> Value {
    let as_string = || Value::String(raw.to_string());
    match schema.get("type").and_then(Value::as_str) {
        Some("integer") => raw.parse::<i64>().map_or_else(|_| as_string(), Value::from),
        Some("number") => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or_else(as_string, Value::Number),
        Some("boolean") => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => as_string(),
        },
        _ => as_string(),
    }
}

fn compile_operation(
    spec: &OpenApiV3Spec,
    template: &str,
    method: Method,
    operation: &oas3::spec::Operation,
    shared_parameters: &[ObjectOrReference<oas3::spec::Parameter>],
) -> Result<Operation, ContractError> {
    let id = operation.operation_id.clone().ok_or_else(|| {
        ContractError::Invalid(format!("{method} {template} に operationId がありません"))
    })?;

    let segments = template
        .trim_start_matches('/')
        .split('/')
        .map(|segment| {
            segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .map_or_else(
                    || Segment::Literal(segment.to_string()),
                    |name| Segment::Param(name.to_string()),
                )
        })
        .collect();

    // オペレーション側の定義が同名のパス共通定義を上書きする
    let mut merged: Vec<(ParameterLocation, oas3::spec::Parameter)> = Vec::new();
    for parameter in shared_parameters.iter().chain(&operation.parameters) {
        let parameter = parameter
            .resolve(spec)
            .map_err(|e| ContractError::UnresolvedRef(e.to_string()))?;
        let Some(location) = ParameterLocation::from_oas(parameter.location) else {
            continue;
        };
        merged.retain(|(existing, other)| !(*existing == location && other.name == parameter.name));
        merged.push((location, parameter));
    }

    let parameters = merged
        .into_iter()
        .map(|(location, parameter)| compile_parameter(spec, &id, location, parameter))
        .collect::<Result<Vec<_>, _>>()?;

    let body = operation
        .request_body
        .as_ref()
        .map(|body| compile_body(spec, &id, body))
        .transpose()?
        .flatten();

    Ok(Operation {
        id,
        method,
        template: template.to_string(),
        segments,
        parameters,
        body,
    })
}

fn compile_parameter(
    spec: &OpenApiV3Spec,
    operation_id: &str,
    location: ParameterLocation,
    parameter: oas3::spec::Parameter,
) -> Result<Parameter, ContractError> {
    let required = location == ParameterLocation::Path || parameter.required.unwrap_or(false);

    let schema = match &parameter.schema {
        Some(schema) => request_schema(schema_value(spec, schema)?),
        None => Value::Bool(true),
    };
    let validator = compile_schema(&schema, &format!("{operation_id}.{}", parameter.name))?;

    Ok(Parameter {
        name: parameter.name,
        location,
        required,
        schema,
        validator,
    })
}

/// `application/json` 以外のボディ定義は検証対象外
fn compile_body(
    spec: &OpenApiV3Spec,
    operation_id: &str,
    body: &ObjectOrReference<oas3::spec::RequestBody>,
) -> Result<Option<RequestBody>, ContractError> {
    let body = body
        .resolve(spec)
        .map_err(|e| ContractError::UnresolvedRef(e.to_string()))?;

    let Some(schema) = body
        .content
        .get("application/json")
        .and_then(|media| media.schema.as_ref())
    else {
        return Ok(None);
    };

    let schema = request_schema(schema_value(spec, schema)?);
    let validator = compile_schema(&schema, &format!("{operation_id}.requestBody"))?;

    Ok(Some(RequestBody {
        required: body.required.unwrap_or(false),
        validator,
    }))
}

fn compile_schema(schema: &Value, location: &str) -> Result<Validator, ContractError> {
    jsonschema::validator_for(schema).map_err(|e| ContractError::Schema {
        location: location.to_string(),
        message:  e.to_string(),
    })
}

/// スキーマを JSON に変換し、`$ref` をすべて展開する
fn schema_value(
    spec: &OpenApiV3Spec,
    schema: &ObjectOrReference<ObjectSchema>,
) -> Result<Value, ContractError> {
    let value = serde_json::to_value(schema)
        .map_err(|e| ContractError::Invalid(format!("スキーマを変換できません: {e}")))?;
    expand_refs(spec, value, 0)
}

fn expand_refs(spec: &OpenApiV3Spec, value: Value, depth: usize) -> Result<Value, ContractError> {
    match value {
        Value::Object(object) => {
            if let Some(reference) = object.get("$ref").and_then(Value::as_str) {
                if depth >= MAX_REF_DEPTH {
                    return Err(ContractError::UnresolvedRef(format!(
                        "{reference}（循環参照）"
                    )));
                }
                let target = lookup_schema(spec, reference)
                    .ok_or_else(|| ContractError::UnresolvedRef(reference.to_string()))?;
                let target = serde_json::to_value(target)
                    .map_err(|e| ContractError::Invalid(format!("{reference}: {e}")))?;
                return expand_refs(spec, target, depth + 1);
            }

            object
                .into_iter()
                .map(|(key, child)| Ok((key, expand_refs(spec, child, depth)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| expand_refs(spec, item, depth))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

fn lookup_schema<'a>(
    spec: &'a OpenApiV3Spec,
    reference: &str,
) -> Option<&'a ObjectOrReference<ObjectSchema>> {
    let name = reference.strip_prefix(SCHEMA_REF_PREFIX)?;
    spec.components.as_ref()?.schemas.get(name)
}

/// OpenAPI のスキーマをリクエスト検証用の JSON Schema に変換する
///
/// - `readOnly` のプロパティを `required` から除く
/// - `format: int32` の整数に範囲制約を加える
fn request_schema(mut schema: Value) -> Value {
    let Value::Object(object) = &mut schema else {
        return schema;
    };

    let read_only: Vec<String> = object
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .filter(|(_, property)| property.get("readOnly") == Some(&Value::Bool(true)))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();
    if let Some(Value::Array(required)) = object.get_mut("required") {
        required.retain(|name| !name.as_str().is_some_and(|name| read_only.iter().any(|r| r == name)));
    }

    let is_int32 = object.get("type").and_then(Value::as_str) == Some("integer")
        && object.get("format").and_then(Value::as_str) == Some("int32");
    if is_int32 {
        object
            .entry("minimum")
            .or_insert_with(|| Value::from(i32::MIN));
        object
            .entry("maximum")
            .or_insert_with(|| Value::from(i32::MAX));
    }

    for child in object.values_mut() {
        let taken = std::mem::take(child);
        *child = match taken {
            Value::Object(_) => request_schema(taken),
            Value::Array(items) => Value::Array(items.into_iter().map(request_schema).collect()),
            other => other,
        };
    }

    schema
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn contract() -> ApiContract {
        ApiContract::embedded("/api").unwrap()
    }

    fn bad_request(result: Result<(), Violation>) -> String {
        match result {
            Err(Violation::BadRequest(message)) => message,
            other => panic!("BadRequest を期待しましたが {other:?} でした"),
        }
    }

    // ===== 読み込みテスト =====

    #[test]
    fn test_埋め込み定義から全オペレーションを読み込む() {
        let contract = contract();

        let mut ids: Vec<&str> = contract.operation_ids().collect();
        ids.sort_unstable();

        assert_eq!(ids, vec!["createUser", "getUser", "getUsers"]);
    }

    #[test]
    fn test_解決できない参照はエラー() {
        let document = r##"
openapi: 3.1.0
info:
  title: test
  version: "1"
paths:
  /things:
    post:
      operationId: createThing
      responses:
        "200":
          description: ok
      requestBody:
        content:
          application/json:
            schema:
              $ref: "#/components/schemas/Missing"
"##;

        let result = ApiContract::from_yaml(document, "");

        assert!(matches!(result, Err(ContractError::UnresolvedRef(_))));
    }

    #[test]
    fn test_operation_idが無い操作はエラー() {
        let document = r#"
openapi: 3.1.0
info:
  title: test
  version: "1"
paths:
  /things:
    get:
      summary: x
      responses:
        "200":
          description: ok
"#;

        let result = ApiContract::from_yaml(document, "");

        assert!(matches!(result, Err(ContractError::Invalid(_))));
    }

    #[test]
    fn test_循環参照はエラー() {
        let document = r##"
openapi: 3.1.0
info:
  title: test
  version: "1"
paths:
  /things:
    post:
      operationId: createThing
      responses:
        "200":
          description: ok
      requestBody:
        content:
          application/json:
            schema:
              $ref: "#/components/schemas/A"
components:
  schemas:
    A:
      $ref: "#/components/schemas/B"
    B:
      $ref: "#/components/schemas/A"
"##;

        let result = ApiContract::from_yaml(document, "");

        assert!(matches!(result, Err(ContractError::UnresolvedRef(_))));
    }

    // ===== マッチングテスト =====

    #[rstest]
    #[case(Method::GET, "/api/users", "getUsers")]
    #[case(Method::POST, "/api/users", "createUser")]
    #[case(Method::GET, "/api/users/42", "getUser")]
    fn test_メソッドとパスでオペレーションを特定する(
        #[case] method: Method,
        #[case] path: &str,
        #[case] expected: &str,
    ) {
        let contract = contract();

        let matched = contract.match_operation(&method, path).unwrap();

        assert_eq!(matched.operation_id(), expected);
    }

    #[rstest]
    #[case(Method::GET, "/api/groups")]
    #[case(Method::DELETE, "/api/users/1")]
    #[case(Method::GET, "/users")]
    #[case(Method::GET, "/apix/users")]
    #[case(Method::GET, "/api/users/1/extra")]
    #[case(Method::GET, "/api/users/")]
    fn test_一致しないリクエストはnot_found(#[case] method: Method, #[case] path: &str) {
        let contract = contract();

        let result = contract.match_operation(&method, path);

        assert!(matches!(result, Err(Violation::NotFound(_))));
    }

    #[test]
    fn test_ベースパスが空ならルート直下で一致する() {
        let contract = ApiContract::embedded("").unwrap();

        let matched = contract.match_operation(&Method::GET, "/users/7").unwrap();

        assert_eq!(matched.template(), "/users/{userid}");
    }

    // ===== パラメーター検証テスト =====

    #[test]
    fn test_整数のパスパラメーターは検証を通る() {
        let contract = contract();
        let matched = contract.match_operation(&Method::GET, "/api/users/42").unwrap();

        assert_eq!(matched.validate_parameters(None), Ok(()));
    }

    #[rstest]
    #[case("/api/users/abc")]
    #[case("/api/users/1.5")]
    #[case("/api/users/2147483648")]
    fn test_整数でないパスパラメーターは400(#[case] path: &str) {
        let contract = contract();
        let matched = contract.match_operation(&Method::GET, path).unwrap();

        let message = bad_request(matched.validate_parameters(None));

        assert!(message.contains("userid"), "{message}");
    }

    #[test]
    fn test_必須クエリパラメーターが無い場合は400() {
        let document = r#"
openapi: 3.1.0
info:
  title: test
  version: "1"
paths:
  /search:
    get:
      operationId: search
      responses:
        "200":
          description: ok
      parameters:
        - name: q
          in: query
          required: true
          schema:
            type: string
            minLength: 2
        - name: limit
          in: query
          schema:
            type: integer
"#;
        let contract = ApiContract::from_yaml(document, "").unwrap();
        let matched = contract.match_operation(&Method::GET, "/search").unwrap();

        assert!(bad_request(matched.validate_parameters(None)).contains("q"));
        assert!(bad_request(matched.validate_parameters(Some("q=a"))).contains("q"));
        assert!(bad_request(matched.validate_parameters(Some("q=ab&limit=x"))).contains("limit"));
        assert_eq!(matched.validate_parameters(Some("q=ab&limit=10")), Ok(()));
    }

    // ===== ボディ検証テスト =====

    #[test]
    fn test_正しいボディは検証を通る() {
        let contract = contract();
        let matched = contract.match_operation(&Method::POST, "/api/users").unwrap();

        let result = matched.validate_body(Some("application/json"), br#"{"name":"Alice"}"#);

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_read_onlyのidは必須扱いしない() {
        let contract = contract();
        let matched = contract.match_operation(&Method::POST, "/api/users").unwrap();

        let result = matched.validate_body(
            Some("application/json; charset=utf-8"),
            br#"{"name":"Alice"}"#,
        );

        assert_eq!(result, Ok(()));
    }

    #[rstest]
    #[case(Some("application/json"), "")]
    #[case(Some("application/json"), r#"{"name":""}"#)]
    #[case(Some("application/json"), r#"{}"#)]
    #[case(Some("application/json"), r#"{"name":1}"#)]
    #[case(Some("application/json"), "{not json")]
    #[case(Some("text/plain"), r#"{"name":"Alice"}"#)]
    #[case(None, r#"{"name":"Alice"}"#)]
    fn test_不正なボディは400(#[case] content_type: Option<&str>, #[case] body: &str) {
        let contract = contract();
        let matched = contract.match_operation(&Method::POST, "/api/users").unwrap();

        let result = matched.validate_body(content_type, body.as_bytes());

        assert!(matches!(result, Err(Violation::BadRequest(_))), "{result:?}");
    }

    #[test]
    fn test_ボディ定義の無い操作ではボディを検証しない() {
        let contract = contract();
        let matched = contract.match_operation(&Method::GET, "/api/users").unwrap();

        assert!(!matched.expects_body());
        assert_eq!(matched.validate_body(None, b"garbage"), Ok(()));
    }

    // ===== スキーマ変換テスト =====

    #[test]
    fn test_request_schemaの変換() {
        let schema = json!({
            "type": "object",
            "required": ["id", "name"],
            "properties": {
                "id": { "type": "integer", "format": "int32", "readOnly": true },
                "name": { "type": "string" }
            }
        });

        let converted = request_schema(schema);

        assert_eq!(converted["required"], json!(["name"]));
        assert_eq!(converted["properties"]["name"], json!({ "type": "string" }));
        assert_eq!(converted["properties"]["id"]["maximum"], json!(i32::MAX));
    }
}
