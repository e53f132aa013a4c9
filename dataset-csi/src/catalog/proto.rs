//! Wire messages of the catalog services and their conversion into the shared
//! dataset types.

use std::collections::HashMap;

use common::{DatasetRecord, DatasetRef, FileReference, ReferenceKind, VolumeDescriptor, VolumeRef};
use prost_types::value::Kind;
use serde_json::{Map, Number, Value};

pub const LIST_DATA_ITEMS_PATH: &str = "/atom.api.DatasetService/ListDataItems";
pub const GET_VOLUME_PATH: &str = "/atom.api.VolumeService/GetVolume";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatasetVersionRef {
    #[prost(string, tag = "1")]
    pub dataset: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(string, tag = "3")]
    pub creator: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListDataItemsReq {
    #[prost(message, optional, tag = "1")]
    pub dataset_version: Option<DatasetVersionRef>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceReference {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub creator: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatumMeta {
    #[prost(message, optional, tag = "1")]
    pub volume_ref: Option<ResourceReference>,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(uint64, tag = "3")]
    pub content_length: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataItem {
    #[prost(message, repeated, tag = "1")]
    pub metas: Vec<DatumMeta>,
    #[prost(map = "string, message", tag = "2")]
    pub annotations: HashMap<String, prost_types::Struct>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetVolumeReq {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub creator: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceVolume {
    #[prost(string, tag = "1")]
    pub bucket: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeSpec {
    #[prost(message, optional, tag = "1")]
    pub resource_volume: Option<ResourceVolume>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Volume {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub spec: Option<VolumeSpec>,
}

impl From<&DatasetRef> for ListDataItemsReq {
    fn from(dataset: &DatasetRef) -> Self {
        ListDataItemsReq {
            dataset_version: Some(DatasetVersionRef {
                dataset: dataset.name.clone(),
                version: dataset.version.clone(),
                creator: dataset.creator.clone(),
            }),
        }
    }
}

impl From<&VolumeRef> for GetVolumeReq {
    fn from(volume: &VolumeRef) -> Self {
        GetVolumeReq {
            name: volume.name.clone(),
            creator: volume.creator.clone(),
        }
    }
}

impl Volume {
    pub fn descriptor(&self) -> Option<VolumeDescriptor> {
        let rv = self.spec.as_ref()?.resource_volume.as_ref()?;
        Some(VolumeDescriptor::new(rv.bucket.clone(), rv.path.clone()))
    }
}

impl From<DataItem> for DatasetRecord {
    fn from(item: DataItem) -> Self {
        let files = item
            .metas
            .into_iter()
            .map(|meta| {
                let volume = meta.volume_ref.unwrap_or_default();
                FileReference {
                    volume: VolumeRef {
                        kind: ReferenceKind::parse(&volume.kind),
                        name: volume.name,
                        creator: volume.creator,
                    },
                    key: meta.key,
                    content_length: meta.content_length,
                }
            })
            .collect();

        let annotations = item
            .annotations
            .into_iter()
            .filter_map(|(key, value)| match struct_to_json(&value) {
                Some(json) => Some((key, json)),
                None => {
                    tracing::warn!("dropping annotation {key}: not representable as JSON");
                    None
                }
            })
            .collect();

        DatasetRecord { files, annotations }
    }
}

/// Converts a protobuf `Struct` to JSON. `None` when it holds a non-finite number.
pub fn struct_to_json(s: &prost_types::Struct) -> Option<Value> {
    let mut map = Map::new();
    for (k, v) in &s.fields {
        map.insert(k.clone(), value_to_json(v)?);
    }
    Some(Value::Object(map))
}

fn value_to_json(value: &prost_types::Value) -> Option<Value> {
    let json = match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::NumberValue(n)) => Value::Number(number_to_json(*n)?),
        Some(Kind::StructValue(s)) => struct_to_json(s)?,
        Some(Kind::ListValue(list)) => Value::Array(
            list.values
                .iter()
                .map(value_to_json)
                .collect::<Option<Vec<_>>>()?,
        ),
    };
    Some(json)
}

// 2^53, the largest range where every integer is exact in an f64
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

fn number_to_json(n: f64) -> Option<Number> {
    if n.fract() == 0.0 && n.abs() <= MAX_EXACT_INT {
        Some(Number::from(n as i64))
    } else {
        Number::from_f64(n)
    }
}
