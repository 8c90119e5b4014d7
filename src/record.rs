// src/record.rs

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Keys owned by the record store. They never enter a record through its field bag.
pub const RESERVED_KEYS: [&str; 3] = ["PartitionKey", "RowKey", "Verified"];

/// The normalized invoice schema, in the order the prompt lists it.
pub const INVOICE_FIELDS: [&str; 13] = [
    "InvoiceNumber",
    "VendorName",
    "VendorTaxId",
    "CustomerName",
    "CustomerAddress",
    "InvoiceDate",
    "DueDate",
    "ServiceEndDate",
    "InvoiceTotal",
    "SubTotal",
    "TotalTax",
    "AmountDue",
    "EnergyUsage_kWh",
];

/// The 13 schema fields. An empty string means "not found".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceFields {
    pub invoice_number: String,
    pub vendor_name: String,
    pub vendor_tax_id: String,
    pub customer_name: String,
    pub customer_address: String,
    pub invoice_date: String,
    pub due_date: String,
    pub service_end_date: String,
    pub invoice_total: String,
    pub sub_total: String,
    pub total_tax: String,
    pub amount_due: String,
    pub energy_usage_kwh: String,
}

impl InvoiceFields {
    fn slot(&mut self, key: &str) -> Option<&mut String> {
        Some(match key {
            "InvoiceNumber" => &mut self.invoice_number,
            "VendorName" => &mut self.vendor_name,
            "VendorTaxId" => &mut self.vendor_tax_id,
            "CustomerName" => &mut self.customer_name,
            "CustomerAddress" => &mut self.customer_address,
            "InvoiceDate" => &mut self.invoice_date,
            "DueDate" => &mut self.due_date,
            "ServiceEndDate" => &mut self.service_end_date,
            "InvoiceTotal" => &mut self.invoice_total,
            "SubTotal" => &mut self.sub_total,
            "TotalTax" => &mut self.total_tax,
            "AmountDue" => &mut self.amount_due,
            "EnergyUsage_kWh" => &mut self.energy_usage_kwh,
            _ => return None,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let v = match key {
            "InvoiceNumber" => &self.invoice_number,
            "VendorName" => &self.vendor_name,
            "VendorTaxId" => &self.vendor_tax_id,
            "CustomerName" => &self.customer_name,
            "CustomerAddress" => &self.customer_address,
            "InvoiceDate" => &self.invoice_date,
            "DueDate" => &self.due_date,
            "ServiceEndDate" => &self.service_end_date,
            "InvoiceTotal" => &self.invoice_total,
            "SubTotal" => &self.sub_total,
            "TotalTax" => &self.total_tax,
            "AmountDue" => &self.amount_due,
            "EnergyUsage_kWh" => &self.energy_usage_kwh,
            _ => return None,
        };
        Some(v.as_str())
    }

    /// How many schema fields carry a value.
    pub fn coverage(&self) -> (usize, usize) {
        let filled = INVOICE_FIELDS
            .iter()
            .filter(|k| self.get(k).is_some_and(|v| !v.is_empty()))
            .count();
        (filled, INVOICE_FIELDS.len())
    }
}

/// Schema fields plus a bag of caller-supplied extras.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatRecord {
    pub fields: InvoiceFields,
    pub extra: BTreeMap<String, String>,
}

impl FlatRecord {
    /// Build from a JSON object. Known keys fill the schema, reserved keys are
    /// dropped, everything else lands in `extra`. Missing schema keys stay empty.
    pub fn from_json_map(map: &Map<String, Value>) -> Self {
        let mut record = FlatRecord::default();
        for (key, val) in map {
            if RESERVED_KEYS.contains(&key.as_str()) {
                debug!(key = %key, "Dropping reserved key from record fields");
                continue;
            }
            let text = stringify(val);
            match record.fields.slot(key) {
                Some(slot) => *slot = text,
                None => {
                    record.extra.insert(key.clone(), text);
                }
            }
        }
        record
    }

    /// Flatten into the property map the store persists: schema fields first, then extras.
    pub fn to_properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        for key in INVOICE_FIELDS {
            let v = self.fields.get(key).unwrap_or_default();
            props.insert(key.to_string(), Value::String(v.to_string()));
        }
        for (k, v) in &self.extra {
            props.insert(k.clone(), Value::String(v.clone()));
        }
        props
    }
}

/// Coerce any JSON value to the string the store keeps.
pub fn stringify(val: &Value) -> String {
    match val {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A persisted invoice entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRecord {
    pub partition_key: String,
    pub row_key: String,
    pub record: FlatRecord,
    pub verified: bool,
}

impl InvoiceRecord {
    /// The entity as the GET endpoint returns it.
    pub fn to_entity_json(&self) -> Value {
        let mut entity = Map::new();
        entity.insert("PartitionKey".into(), Value::String(self.partition_key.clone()));
        entity.insert("RowKey".into(), Value::String(self.row_key.clone()));
        entity.extend(self.record.to_properties());
        entity.insert("Verified".into(), Value::Bool(self.verified));
        Value::Object(entity)
    }
}
