//! The shared state container and its utilities (deep-merge, diff).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};
use crate::patch::{PatchDraft, PatchMode, apply_mode};
use crate::shape::{ShapeRegistry, ValueType};

/// Whether a field is an order-significant log or a replaceable value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// Only ever extended at the end; never rewritten in place.
    AppendOnly,
    #[default]
    Overwrite,
}

/// Declared (or inferred) contract of one state field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(default)]
    pub region: Region,
    /// Locked logical type. `None` until declared or first written with a non-null value.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<ValueType>,
}

impl FieldSpec {
    pub fn overwrite(ty: ValueType) -> Self {
        Self {
            region: Region::Overwrite,
            ty: Some(ty),
        }
    }

    /// An append-only log whose elements have type `item`.
    pub fn append_only(item: ValueType) -> Self {
        Self {
            region: Region::AppendOnly,
            ty: Some(ValueType::array(item)),
        }
    }
}

/// Declared layout of a session's state: ordered fields with initial values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSchema {
    pub fields: Vec<FieldDecl>,
    /// Reject patches to fields that were never declared.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(flatten)]
    pub spec: FieldSpec,
    #[serde(default)]
    pub initial: Value,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec, initial: Value) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            spec,
            initial,
        });
        self
    }
}

/// Ordered-field, arbitrarily nested structured value.
///
/// Besides the values themselves the container tracks each field's spec and
/// the sequence number at which it was last written.
#[derive(Debug, Clone, Default)]
pub struct StateContainer {
    values: Map<String, Value>,
    specs: BTreeMap<String, FieldSpec>,
    versions: BTreeMap<String, u64>,
    strict: bool,
}

impl StateContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a container from a declared schema, validating initial values.
    pub fn from_schema(schema: &StateSchema, shapes: &ShapeRegistry) -> Result<Self> {
        let mut container = Self {
            strict: schema.strict,
            ..Self::default()
        };
        for decl in &schema.fields {
            let initial = match (&decl.initial, decl.spec.region) {
                (Value::Null, Region::AppendOnly) => Value::Array(Vec::new()),
                (v, _) => v.clone(),
            };
            if let (Some(ty), false) = (&decl.spec.ty, initial.is_null()) {
                ty.check(&initial, shapes)
                    .map_err(|e| SyncError::validation(&decl.name, e))?;
            }
            container.values.insert(decl.name.clone(), initial);
            container.specs.insert(decl.name.clone(), decl.spec.clone());
        }
        Ok(container)
    }

    /// Build a schema-free container from an object value; field types are
    /// inferred from the non-null initial values.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(values) = value else {
            return Err(SyncError::validation("<root>", "state must be an object"));
        };
        let specs = values
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    FieldSpec {
                        region: Region::Overwrite,
                        ty: ValueType::infer(v),
                    },
                )
            })
            .collect();
        Ok(Self {
            values,
            specs,
            versions: BTreeMap::new(),
            strict: false,
        })
    }

    /// Declare (or redeclare before first write) a field's spec.
    pub fn declare(&mut self, name: impl Into<String>, spec: FieldSpec) {
        let name = name.into();
        if spec.region == Region::AppendOnly {
            let slot = self.values.entry(name.clone()).or_insert(Value::Null);
            if slot.is_null() {
                *slot = Value::Array(Vec::new());
            }
        } else {
            self.values.entry(name.clone()).or_insert(Value::Null);
        }
        self.specs.insert(name, spec);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn spec(&self, field: &str) -> Option<&FieldSpec> {
        self.specs.get(field)
    }

    pub fn region(&self, field: &str) -> Region {
        self.specs.get(field).map(|s| s.region).unwrap_or_default()
    }

    /// Sequence number at which `field` was last written (0 = never patched).
    pub fn version(&self, field: &str) -> u64 {
        self.versions.get(field).copied().unwrap_or(0)
    }

    /// Check a patch against the field's region and locked type without applying it.
    pub fn validate(&self, draft: &PatchDraft, shapes: &ShapeRegistry) -> Result<()> {
        let field = draft.target_field.as_str();
        let spec = match self.specs.get(field) {
            Some(spec) => spec.clone(),
            None if self.strict => return Err(SyncError::UnknownField(field.to_string())),
            None => FieldSpec {
                region: if draft.mode == PatchMode::Append {
                    Region::AppendOnly
                } else {
                    Region::Overwrite
                },
                ty: None,
            },
        };

        match (spec.region, draft.mode) {
            (Region::AppendOnly, PatchMode::Append) | (Region::Overwrite, PatchMode::Replace) => {}
            (Region::Overwrite, PatchMode::Merge) => {
                if !draft.payload.is_object() {
                    return Err(SyncError::validation(field, "merge payload must be an object"));
                }
                match self.values.get(field) {
                    None | Some(Value::Null) | Some(Value::Object(_)) => {}
                    Some(_) => {
                        return Err(SyncError::validation(
                            field,
                            "merge target is not an object",
                        ));
                    }
                }
            }
            (region, mode) => {
                return Err(SyncError::validation(
                    field,
                    format!("{mode} is not allowed on {region:?} field"),
                ));
            }
        }

        let Some(ty) = &spec.ty else {
            // Unlocked: the first non-null write locks the type, nothing to check yet.
            return Ok(());
        };

        let result = match draft.mode {
            PatchMode::Append => match ty {
                ValueType::Array { items } => items.check(&draft.payload, shapes),
                ValueType::Any => Ok(()),
                other => Err(format!("cannot append to {}", other.name())),
            },
            // Fields start out null before their first write, so null is always accepted.
            PatchMode::Replace if draft.payload.is_null() => Ok(()),
            PatchMode::Replace => ty.check(&draft.payload, shapes),
            PatchMode::Merge => {
                let mut merged = self.values.get(field).cloned().unwrap_or(Value::Null);
                deep_merge(&mut merged, &draft.payload);
                ty.check(&merged, shapes)
            }
        };
        result.map_err(|e| SyncError::validation(field, e))
    }

    /// Validate and apply a patch, recording `seq` as the field's version.
    pub fn apply(&mut self, draft: &PatchDraft, seq: u64, shapes: &ShapeRegistry) -> Result<()> {
        self.validate(draft, shapes)?;
        let field = draft.target_field.clone();

        let spec = self.specs.entry(field.clone()).or_insert_with(|| FieldSpec {
            region: if draft.mode == PatchMode::Append {
                Region::AppendOnly
            } else {
                Region::Overwrite
            },
            ty: None,
        });

        let slot = self.values.entry(field.clone()).or_insert(Value::Null);
        apply_mode(slot, draft.mode, &draft.payload);

        if spec.ty.is_none() {
            spec.ty = ValueType::infer(slot);
        }
        self.versions.insert(field, seq);
        Ok(())
    }

    /// Apply a confirmed patch without validation. Used on mirrors, which hold
    /// no schema and trust the canonical side.
    pub fn apply_unchecked(&mut self, draft: &PatchDraft) {
        let slot = self
            .values
            .entry(draft.target_field.clone())
            .or_insert(Value::Null);
        apply_mode(slot, draft.mode, &draft.payload);
    }

    /// Replace all values wholesale (snapshot install). Specs and versions are dropped.
    pub fn reset_to(&mut self, values: Map<String, Value>) {
        self.values = values;
        self.specs.clear();
        self.versions.clear();
    }

    /// Patches that would turn this container's values into `new`.
    pub fn diff(&self, new: &Map<String, Value>) -> Vec<PatchDraft> {
        diff(&self.values, new, |field| {
            self.region(field) == Region::AppendOnly
        })
    }
}

impl PartialEq for StateContainer {
    /// Containers are equal when their values are; bookkeeping is ignored.
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

/// Recursively merge `patch` into `target`. Objects merge key by key; any
/// other value replaces what was there.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        dst.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Per-field patches taking `old` to `new`.
///
/// Fields for which `is_append` holds and whose old array is a prefix of the
/// new one produce one `append` per new element; everything else that changed
/// produces a `replace`. Fields missing from `new` are left alone.
pub fn diff(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    is_append: impl Fn(&str) -> bool,
) -> Vec<PatchDraft> {
    let mut drafts = Vec::new();
    for (field, new_value) in new {
        let old_value = old.get(field);
        if old_value == Some(new_value) {
            continue;
        }
        if is_append(field) {
            if let (Some(Value::Array(before)), Value::Array(after)) = (old_value, new_value) {
                if after.len() >= before.len() && after[..before.len()] == before[..] {
                    drafts.extend(
                        after[before.len()..]
                            .iter()
                            .map(|item| PatchDraft::append(field.clone(), item.clone())),
                    );
                    continue;
                }
            }
        }
        drafts.push(PatchDraft::replace(field.clone(), new_value.clone()));
    }
    drafts
}

/// Names of top-level fields whose values differ between `old` and `new`.
pub fn changed_fields(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<String> {
    let mut fields: Vec<String> = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    fields.extend(
        old.keys()
            .filter(|k| !new.contains_key(*k))
            .cloned(),
    );
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ShapeSchema;
    use serde_json::json;

    fn weather_shapes() -> ShapeRegistry {
        ShapeRegistry::new().with(
            ShapeSchema::new("WeatherResponse")
                .field("conditions", ValueType::String)
                .field("temperature", ValueType::Number)
                .field("wind_direction", ValueType::String)
                .field("wind_speed", ValueType::Number),
        )
    }

    fn weather_state(shapes: &ShapeRegistry) -> StateContainer {
        let schema = StateSchema::new()
            .field(
                "final_response",
                FieldSpec::overwrite(ValueType::optional(ValueType::shape("WeatherResponse"))),
                Value::Null,
            )
            .field("input", FieldSpec::overwrite(ValueType::String), json!("nyc"))
            .field("messages", FieldSpec::append_only(ValueType::Object), Value::Null);
        StateContainer::from_schema(&schema, shapes).unwrap()
    }

    #[test]
    fn test_from_schema_keeps_field_order() {
        let shapes = weather_shapes();
        let state = weather_state(&shapes);
        let names: Vec<&str> = state.field_names().collect();
        assert_eq!(names, vec!["final_response", "input", "messages"]);
        assert_eq!(state.get("messages"), Some(&json!([])));
    }

    #[test]
    fn test_apply_shape_payload() {
        let shapes = weather_shapes();
        let mut state = weather_state(&shapes);
        let payload = json!({
            "conditions": "cloudy",
            "temperature": 70,
            "wind_direction": "NE",
            "wind_speed": 5
        });
        state
            .apply(&PatchDraft::replace("final_response", payload.clone()), 1, &shapes)
            .unwrap();
        assert_eq!(state.get("final_response"), Some(&payload));
        assert_eq!(state.get("input"), Some(&json!("nyc")));
        assert_eq!(state.version("final_response"), 1);
        assert_eq!(state.version("input"), 0);
    }

    #[test]
    fn test_invalid_payload_leaves_state_untouched() {
        let shapes = weather_shapes();
        let mut state = weather_state(&shapes);
        let before = state.clone();
        let err = state
            .apply(
                &PatchDraft::replace("final_response", json!({"conditions": 1})),
                1,
                &shapes,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn test_append_only_rejects_replace() {
        let shapes = weather_shapes();
        let mut state = weather_state(&shapes);
        let err = state
            .apply(&PatchDraft::replace("messages", json!([])), 1, &shapes)
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));

        state
            .apply(
                &PatchDraft::append("messages", json!({"role": "assistant", "content": "hi"})),
                2,
                &shapes,
            )
            .unwrap();
        assert_eq!(state.get("messages").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_inferred_type_is_locked() {
        let shapes = ShapeRegistry::new();
        let mut state = StateContainer::from_value(json!({"count": 1, "label": null})).unwrap();
        assert!(
            state
                .apply(&PatchDraft::replace("count", json!("one")), 1, &shapes)
                .is_err()
        );
        state
            .apply(&PatchDraft::replace("label", json!("first")), 2, &shapes)
            .unwrap();
        assert!(
            state
                .apply(&PatchDraft::replace("label", json!(3)), 3, &shapes)
                .is_err()
        );
    }

    #[test]
    fn test_strict_rejects_unknown_field() {
        let shapes = weather_shapes();
        let schema = StateSchema::new()
            .strict()
            .field("input", FieldSpec::overwrite(ValueType::String), json!("nyc"));
        let mut state = StateContainer::from_schema(&schema, &shapes).unwrap();
        let err = state
            .apply(&PatchDraft::replace("other", json!(1)), 1, &shapes)
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownField(_)));
    }

    #[test]
    fn test_merge_requires_object_target() {
        let shapes = ShapeRegistry::new();
        let mut state = StateContainer::from_value(json!({"cfg": {"a": 1}, "n": 2})).unwrap();
        state
            .apply(&PatchDraft::merge("cfg", json!({"b": 2})), 1, &shapes)
            .unwrap();
        assert_eq!(state.get("cfg"), Some(&json!({"a": 1, "b": 2})));
        assert!(
            state
                .apply(&PatchDraft::merge("n", json!({"b": 2})), 2, &shapes)
                .is_err()
        );
    }

    #[test]
    fn test_deep_merge_replaces_non_objects() {
        let mut v = json!({"a": [1, 2], "b": {"c": 1}});
        deep_merge(&mut v, &json!({"a": [3], "b": {"d": 2}}));
        assert_eq!(v, json!({"a": [3], "b": {"c": 1, "d": 2}}));
    }

    #[test]
    fn test_diff_appends_and_replaces() {
        let old = json!({"messages": ["a"], "x": 1, "y": 2});
        let new = json!({"messages": ["a", "b", "c"], "x": 1, "y": 3});
        let drafts = diff(
            old.as_object().unwrap(),
            new.as_object().unwrap(),
            |f| f == "messages",
        );
        assert_eq!(
            drafts,
            vec![
                PatchDraft::append("messages", json!("b")),
                PatchDraft::append("messages", json!("c")),
                PatchDraft::replace("y", json!(3)),
            ]
        );
    }

    #[test]
    fn test_diff_replays_to_target() {
        let old = json!({"messages": ["a"], "x": {"k": 1}});
        let new = json!({"messages": ["a", "b"], "x": {"k": 2}, "z": true});
        let mut state = StateContainer::from_value(old).unwrap();
        for draft in diff(
            state.values(),
            new.as_object().unwrap(),
            |f| f == "messages",
        ) {
            state.apply_unchecked(&draft);
        }
        assert_eq!(state.to_value(), new);
    }

    #[test]
    fn test_changed_fields() {
        let old = json!({"a": 1, "b": 2, "gone": 0});
        let new = json!({"a": 1, "b": 3, "c": 4});
        let fields = changed_fields(old.as_object().unwrap(), new.as_object().unwrap());
        assert_eq!(fields, vec!["b", "c", "gone"]);
    }
}
