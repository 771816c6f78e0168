use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use sentiscope_contracts::credentials::Credential;

use crate::providers::{AnalysisProvider, AnalysisRequest};

type Responder = Box<dyn Fn(&AnalysisRequest, usize) -> std::result::Result<String, String>>;

/// In-memory provider that answers from a script or a closure and records
/// every request it receives.
pub(crate) struct ScriptedProvider {
    responder: Responder,
    credential: Option<String>,
    calls: Rc<RefCell<Vec<AnalysisRequest>>>,
    credentials_used: Rc<RefCell<Vec<String>>>,
}

impl ScriptedProvider {
    /// Answers calls in order; once the script runs out every call fails.
    pub(crate) fn new(script: Vec<std::result::Result<String, String>>) -> Self {
        let script = RefCell::new(VecDeque::from(script));
        Self::with_responder(move |_, _| {
            script
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_string()))
        })
    }

    pub(crate) fn failing() -> Self {
        Self::with_responder(|_, _| Err("service unavailable".to_string()))
    }

    /// `responder` gets the request and the zero-based call number.
    pub(crate) fn with_responder(
        responder: impl Fn(&AnalysisRequest, usize) -> Result<String, String> + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            credential: None,
            calls: Rc::new(RefCell::new(Vec::new())),
            credentials_used: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub(crate) fn calls(&self) -> Rc<RefCell<Vec<AnalysisRequest>>> {
        Rc::clone(&self.calls)
    }

    pub(crate) fn credentials_used(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.credentials_used)
    }
}

impl AnalysisProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn configure(&mut self, credential: &Credential) {
        self.credential = Some(credential.label().to_string());
    }

    fn invoke(&self, request: &AnalysisRequest) -> Result<String> {
        let call = self.calls.borrow().len();
        self.calls.borrow_mut().push(request.clone());
        self.credentials_used
            .borrow_mut()
            .push(self.credential.clone().unwrap_or_default());
        (self.responder)(request, call).map_err(|message| anyhow!(message))
    }
}
