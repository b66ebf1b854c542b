// ABOUTME: Shared test fixtures and scripted bus peers for behavioral tests
//
// Provides:
// - loopback(): InMemoryBus plus its trait-object handle
// - ProjectHost: answers manifest and resource requests for one project,
//   immediately or deferred (to replay replies out of order or twice)
// - WorkerFarm: announces workers and confirms bind requests

#![allow(dead_code)]

use busline::bus::{HandlerRegistration, InMemoryBus, Message, MessageBus, Payload};
use busline::protocol::{
    self, CallbackId, GetProjectResponse, GetResourceRequest, GetResourceResponse, ResourceEntry,
    ServiceReady, StartServiceRequest, StartServiceResponse, GET_PROJECT_REQUEST,
    GET_PROJECT_RESPONSE, GET_RESOURCE_REQUEST, GET_RESOURCE_RESPONSE, SERVICE_READY,
    START_SERVICE_REQUEST, START_SERVICE_RESPONSE, USERNAME,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory bus and the handle components take
pub fn loopback() -> (Arc<InMemoryBus>, Arc<dyn MessageBus>) {
    let bus = Arc::new(InMemoryBus::new());
    let dyn_bus: Arc<dyn MessageBus> = bus.clone();
    (bus, dyn_bus)
}

/// Build a payload from a `json!` object
pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be a JSON object")
}

// === Project Host ===

/// Scripted project server
pub struct ProjectHost {
    project: String,
    entries: Vec<ResourceEntry>,
    contents: HashMap<String, (i64, String)>,
    defer_resources: bool,
    pending: Arc<Mutex<Vec<GetResourceRequest>>>,
    bus: Option<Arc<InMemoryBus>>,
    handlers: Vec<HandlerRegistration>,
}

impl ProjectHost {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            entries: Vec::new(),
            contents: HashMap::new(),
            defer_resources: false,
            pending: Arc::new(Mutex::new(Vec::new())),
            bus: None,
            handlers: Vec::new(),
        }
    }

    pub fn folder(mut self, path: &str, timestamp: i64) -> Self {
        self.entries.push(ResourceEntry::folder(path, timestamp));
        self
    }

    pub fn file(mut self, path: &str, timestamp: i64, content: &str) -> Self {
        self.entries.push(ResourceEntry::file(path, timestamp));
        self.contents
            .insert(path.to_string(), (timestamp, content.to_string()));
        self
    }

    /// Hold resource requests until `answer_pending` is called
    pub fn deferred(mut self) -> Self {
        self.defer_resources = true;
        self
    }

    /// Install the host's handlers on `bus`
    pub fn serve(mut self, bus: &Arc<InMemoryBus>) -> Self {
        let project = self.project.clone();
        let entries = self.entries.clone();
        let reply_bus = Arc::clone(bus);
        self.handlers.push(HandlerRegistration::register(
            bus.clone(),
            GET_PROJECT_REQUEST,
            |_| true,
            move |message| {
                let reply = GetProjectResponse {
                    callback_id: CallbackId::of(message),
                    username: message.str_field(USERNAME).unwrap_or_default().to_string(),
                    project: project.clone(),
                    files: entries.clone(),
                };
                publish(&reply_bus, GET_PROJECT_RESPONSE, &reply);
            },
        ));

        let contents = self.contents.clone();
        let pending = Arc::clone(&self.pending);
        let defer = self.defer_resources;
        let reply_bus = Arc::clone(bus);
        self.handlers.push(HandlerRegistration::register(
            bus.clone(),
            GET_RESOURCE_REQUEST,
            |_| true,
            move |message| {
                let request: GetResourceRequest =
                    protocol::from_payload(&message.payload).expect("valid resource request");
                if defer {
                    pending.lock().unwrap().push(request);
                } else {
                    reply_resource(&reply_bus, &contents, &request);
                }
            },
        ));

        self.bus = Some(Arc::clone(bus));
        self
    }

    /// Resource requests received so far and not yet answered
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Answer held requests in reverse order, each `copies` times
    pub fn answer_pending(&self, copies: usize) {
        let bus = self.bus.as_ref().expect("host is serving");
        let requests: Vec<GetResourceRequest> = self.pending.lock().unwrap().drain(..).collect();
        for request in requests.iter().rev() {
            for _ in 0..copies {
                reply_resource(bus, &self.contents, request);
            }
        }
    }

    /// Send a resource reply the session never asked for
    pub fn send_unrequested(&self, callback_id: CallbackId, username: &str, resource: &str) {
        let bus = self.bus.as_ref().expect("host is serving");
        let reply = GetResourceResponse {
            callback_id: Some(callback_id),
            username: username.to_string(),
            resource: resource.to_string(),
            timestamp: 1,
            content: "surprise".to_string(),
        };
        publish(bus, GET_RESOURCE_RESPONSE, &reply);
    }
}

fn reply_resource(
    bus: &InMemoryBus,
    contents: &HashMap<String, (i64, String)>,
    request: &GetResourceRequest,
) {
    let (timestamp, content) = contents
        .get(&request.resource)
        .cloned()
        .expect("requested resource is listed");
    let reply = GetResourceResponse {
        callback_id: Some(request.callback_id),
        username: request.username.clone(),
        resource: request.resource.clone(),
        timestamp,
        content,
    };
    publish(bus, GET_RESOURCE_RESPONSE, &reply);
}

// === Worker Farm ===

/// How the farm answers bind requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindReply {
    /// Echo the request's callback id
    Echo,
    /// Omit the callback id (older workers)
    Legacy,
    /// Never answer
    Silent,
}

/// Scripted pool of workers for one service
pub struct WorkerFarm {
    service: String,
    bus: Arc<InMemoryBus>,
    binds: Arc<Mutex<Vec<StartServiceRequest>>>,
    _responder: HandlerRegistration,
}

impl WorkerFarm {
    pub fn new(bus: &Arc<InMemoryBus>, service: &str, reply: BindReply) -> Self {
        let binds = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&binds);
        let reply_bus = Arc::clone(bus);
        let watched = service.to_string();
        let responder = HandlerRegistration::register(
            bus.clone(),
            START_SERVICE_REQUEST,
            move |message: &Message| message.field_equals("service", &watched),
            move |message| {
                let request: StartServiceRequest =
                    protocol::from_payload(&message.payload).expect("valid bind request");
                seen.lock().unwrap().push(request.clone());
                let callback_id = match reply {
                    BindReply::Echo => request.callback_id,
                    BindReply::Legacy => None,
                    BindReply::Silent => return,
                };
                let confirmation = StartServiceResponse {
                    service: request.service,
                    username: request.username,
                    socket_id: request.socket_id,
                    callback_id,
                };
                publish(&reply_bus, START_SERVICE_RESPONSE, &confirmation);
            },
        );

        Self {
            service: service.to_string(),
            bus: Arc::clone(bus),
            binds,
            _responder: responder,
        }
    }

    /// Broadcast `serviceReady` for a worker
    pub fn announce(&self, socket: &str) {
        let ready = ServiceReady {
            service: self.service.clone(),
            socket_id: socket.to_string(),
        };
        publish(&self.bus, SERVICE_READY, &ready);
    }

    /// Bind requests received so far
    pub fn bind_requests(&self) -> Vec<StartServiceRequest> {
        self.binds.lock().unwrap().clone()
    }
}

fn publish<T: serde::Serialize>(bus: &InMemoryBus, kind: &str, message: &T) {
    let payload = protocol::to_payload(message).expect("serializable message");
    bus.publish(kind, payload).expect("loopback bus accepts messages");
}
