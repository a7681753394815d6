//! Scripted inspector for session and harvester tests. Property tables are
//! seeded per object id; installed breakpoints and resume counts are recorded
//! for assertions.

use super::client::{Inspector, InspectorError};
use super::protocol::{PropertyDescriptor, RemoteObject};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct InstalledBreakpoint {
    pub breakpoint_id: String,
    pub line_number: u32,
    pub url_regex: String,
    pub condition: Option<String>,
}

#[derive(Default)]
struct MockState {
    enabled: bool,
    pause_state: Option<String>,
    resume_count: usize,
    objects: HashMap<String, Vec<PropertyDescriptor>>,
    installed: Vec<InstalledBreakpoint>,
    removed: Vec<String>,
    next_breakpoint: u64,
    fail_properties: bool,
    fail_set_breakpoint: bool,
}

#[derive(Default)]
pub struct MockInspector {
    state: Mutex<MockState>,
}

impl MockInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the property table served for `object_id`.
    pub fn add_object(&self, object_id: &str, properties: Vec<PropertyDescriptor>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.objects.insert(object_id.to_string(), properties);
    }

    pub fn fail_properties(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_properties = true;
    }

    pub fn fail_set_breakpoint(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_set_breakpoint = true;
    }

    pub fn resume_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resume_count
    }

    pub fn pause_state(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pause_state
            .clone()
    }

    pub fn installed(&self) -> Vec<InstalledBreakpoint> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .installed
            .clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .removed
            .clone()
    }
}

#[async_trait]
impl Inspector for MockInspector {
    async fn enable(&self) -> Result<(), InspectorError> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).enabled = true;
        Ok(())
    }

    async fn set_pause_on_exceptions(&self, state: &str) -> Result<(), InspectorError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pause_state = Some(state.to_string());
        Ok(())
    }

    async fn set_breakpoint_by_url(
        &self,
        line_number: u32,
        url_regex: &str,
        condition: Option<&str>,
    ) -> Result<String, InspectorError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_set_breakpoint {
            return Err(InspectorError::Command {
                code: -32000,
                message: "breakpoint rejected".to_string(),
            });
        }
        state.next_breakpoint += 1;
        let breakpoint_id = format!("mock-bp-{}", state.next_breakpoint);
        state.installed.push(InstalledBreakpoint {
            breakpoint_id: breakpoint_id.clone(),
            line_number,
            url_regex: url_regex.to_string(),
            condition: condition.map(str::to_string),
        });
        Ok(breakpoint_id)
    }

    async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<(), InspectorError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .removed
            .push(breakpoint_id.to_string());
        Ok(())
    }

    async fn get_properties(
        &self,
        object_id: &str,
    ) -> Result<Vec<PropertyDescriptor>, InspectorError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_properties {
            return Err(InspectorError::Disconnected);
        }
        Ok(state.objects.get(object_id).cloned().unwrap_or_default())
    }

    async fn resume(&self) -> Result<(), InspectorError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resume_count += 1;
        Ok(())
    }

    async fn disable(&self) -> Result<(), InspectorError> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).enabled = false;
        Ok(())
    }
}

pub fn property(name: &str, value: RemoteObject) -> PropertyDescriptor {
    PropertyDescriptor {
        name: name.to_string(),
        value: Some(value),
    }
}

pub fn number_object(description: &str) -> RemoteObject {
    RemoteObject {
        object_type: "number".to_string(),
        value: description.parse::<f64>().ok().map(|n| json!(n)),
        description: Some(description.to_string()),
        ..RemoteObject::default()
    }
}

pub fn string_object(value: &str) -> RemoteObject {
    RemoteObject {
        object_type: "string".to_string(),
        value: Some(json!(value)),
        description: Some(value.to_string()),
        ..RemoteObject::default()
    }
}

pub fn boolean_object(value: bool) -> RemoteObject {
    RemoteObject {
        object_type: "boolean".to_string(),
        value: Some(json!(value)),
        description: Some(value.to_string()),
        ..RemoteObject::default()
    }
}

pub fn undefined_object() -> RemoteObject {
    RemoteObject {
        object_type: "undefined".to_string(),
        ..RemoteObject::default()
    }
}

pub fn null_object() -> RemoteObject {
    RemoteObject {
        object_type: "object".to_string(),
        subtype: Some("null".to_string()),
        ..RemoteObject::default()
    }
}

pub fn array_object(length: usize, object_id: &str) -> RemoteObject {
    RemoteObject {
        object_type: "object".to_string(),
        subtype: Some("array".to_string()),
        class_name: Some("Array".to_string()),
        description: Some(format!("Array({length})")),
        object_id: Some(object_id.to_string()),
        ..RemoteObject::default()
    }
}

pub fn plain_object(class_name: &str, object_id: &str) -> RemoteObject {
    RemoteObject {
        object_type: "object".to_string(),
        class_name: Some(class_name.to_string()),
        description: Some(class_name.to_string()),
        object_id: Some(object_id.to_string()),
        ..RemoteObject::default()
    }
}

pub fn error_object(description: &str) -> RemoteObject {
    RemoteObject {
        object_type: "object".to_string(),
        subtype: Some("error".to_string()),
        class_name: Some(
            description
                .split(':')
                .next()
                .unwrap_or("Error")
                .to_string(),
        ),
        description: Some(description.to_string()),
        ..RemoteObject::default()
    }
}
