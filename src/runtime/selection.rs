//! Model, knowledge base, tool and thinking selection
//!
//! Holds the catalog fetched from the backend together with the choices
//! that parametrize the next generation.

use super::error::SessionError;
use crate::api::{KbCatalog, KbId, ModelId, ModelInfo, PersistedMessage, SessionId};
use crate::state_machine::{GenerationOptions, GenerationParams, Role};

/// Tool key for web search
pub const WEB_SEARCH: &str = "webSearch";

#[derive(Debug, Clone, Default)]
pub struct Selection {
    models: Vec<ModelInfo>,
    kbs: KbCatalog,
    model_id: Option<ModelId>,
    kb_id: Option<KbId>,
    tools: Vec<String>,
    thinking_enabled: bool,
    /// User turned web search off; survives model switches
    web_search_unchecked: bool,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a preferred model and knowledge base, applied once a
    /// catalog is known
    pub fn with_preferences(model_id: Option<ModelId>, kb_id: Option<KbId>) -> Self {
        Self {
            model_id,
            kb_id,
            ..Self::default()
        }
    }

    pub fn set_catalog(&mut self, models: Vec<ModelInfo>, kbs: KbCatalog) {
        self.models = models;
        self.kbs = kbs;
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn model_id(&self) -> Option<&ModelId> {
        self.model_id.as_ref()
    }

    pub fn kb_id(&self) -> Option<&KbId> {
        self.kb_id.as_ref()
    }

    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub fn thinking_enabled(&self) -> bool {
        self.thinking_enabled
    }

    pub fn current_model(&self) -> Option<&ModelInfo> {
        let id = self.model_id.as_ref()?;
        self.models.iter().find(|m| &m.model_id == id)
    }

    pub fn available_tools(&self) -> &[String] {
        self.current_model().map_or(&[][..], ModelInfo::tools)
    }

    fn offers_web_search(&self) -> bool {
        self.current_model()
            .is_some_and(|m| m.offers_tool(WEB_SEARCH))
    }

    pub fn supports_kb(&self) -> bool {
        self.current_model().map_or(true, ModelInfo::supports_kb)
    }

    fn thinking_editable(&self) -> bool {
        self.current_model()
            .and_then(ModelInfo::thinking)
            .map_or(true, |t| t.editable)
    }

    fn thinking_default(&self) -> bool {
        self.current_model()
            .and_then(ModelInfo::thinking)
            .is_some_and(|t| t.default)
    }

    /// Switch models. Tools the new model lacks are dropped. Unless
    /// restoring a session, web search is preselected when offered and not
    /// turned off by the user, and thinking resets to the model default.
    pub fn select_model(&mut self, model_id: ModelId, restoring: bool) -> Result<(), SessionError> {
        if !self.models.iter().any(|m| m.model_id == model_id) {
            return Err(SessionError::UnknownModel(model_id));
        }
        self.model_id = Some(model_id);
        self.apply_model_change(restoring);
        Ok(())
    }

    fn apply_model_change(&mut self, restoring: bool) {
        let supported = self.available_tools().to_vec();
        self.tools.retain(|t| supported.contains(t));

        if restoring {
            return;
        }
        if self.offers_web_search()
            && !self.web_search_unchecked
            && !self.tools.iter().any(|t| t == WEB_SEARCH)
        {
            self.tools.push(WEB_SEARCH.to_string());
        }
        self.thinking_enabled = self.thinking_default();
    }

    pub fn select_kb(&mut self, kb_id: Option<KbId>) -> Result<(), SessionError> {
        if let Some(id) = &kb_id {
            if self.kbs.find(id).is_none() {
                return Err(SessionError::UnknownKnowledgeBase(id.clone()));
            }
        }
        self.kb_id = kb_id;
        Ok(())
    }

    /// Returns false when the current model does not offer `tool`
    pub fn toggle_tool(&mut self, tool: &str) -> bool {
        if !self.available_tools().iter().any(|t| t == tool) {
            return false;
        }
        match self.tools.iter().position(|t| t == tool) {
            Some(index) => {
                self.tools.remove(index);
                if tool == WEB_SEARCH {
                    self.web_search_unchecked = true;
                }
            }
            None => {
                self.tools.push(tool.to_string());
                if tool == WEB_SEARCH {
                    self.web_search_unchecked = false;
                }
            }
        }
        true
    }

    /// Returns false when the model pins thinking to its default
    pub fn toggle_thinking(&mut self) -> bool {
        if !self.thinking_editable() {
            return false;
        }
        self.thinking_enabled = !self.thinking_enabled;
        true
    }

    /// Restore selections from a session's history: model and knowledge
    /// base from the last message, tools and thinking from the last user
    /// message's options.
    pub fn restore(&mut self, history: &[PersistedMessage]) {
        let last = history.last();

        if let Some(model_id) = last.and_then(|m| m.model_id.clone()) {
            if self.models.iter().any(|m| m.model_id == model_id) {
                self.model_id = Some(model_id);
            }
        }
        if self.current_model().is_none() {
            self.model_id = self.models.first().map(|m| m.model_id.clone());
        }
        self.apply_model_change(true);

        self.kb_id = last
            .and_then(|m| m.kb_id.clone())
            .filter(|id| self.supports_kb() && self.kbs.find(id).is_some());

        let last_user = history.iter().rev().find(|m| m.role == Role::User);
        let options = last_user.and_then(PersistedMessage::parsed_options);
        self.restore_tools(last_user.is_some(), options.as_ref());
    }

    /// `options` are those the last user message was sent with
    pub fn restore_tools(&mut self, has_user_message: bool, options: Option<&GenerationOptions>) {
        let offers_web_search = self.offers_web_search();
        self.tools.clear();

        match options {
            Some(opts) => {
                if opts.web_search() {
                    self.tools.push(WEB_SEARCH.to_string());
                    self.web_search_unchecked = false;
                } else if offers_web_search {
                    self.web_search_unchecked = true;
                }
                self.thinking_enabled = opts.thinking();
            }
            None => {
                if offers_web_search {
                    self.tools.push(WEB_SEARCH.to_string());
                }
                self.web_search_unchecked = false;
                // an existing conversation without recorded options starts
                // with thinking off
                self.thinking_enabled = !has_user_message && self.thinking_default();
            }
        }

        if !self.thinking_editable() {
            self.thinking_enabled = self.thinking_default();
        }
    }

    pub fn options(&self) -> GenerationOptions {
        let has_thinking = self.current_model().and_then(ModelInfo::thinking).is_some();
        GenerationOptions {
            web_search: self.tools.iter().any(|t| t == WEB_SEARCH).then_some(true),
            thinking: (has_thinking && self.thinking_enabled).then_some(true),
            ..GenerationOptions::default()
        }
    }

    pub fn params(&self, session_id: SessionId) -> GenerationParams {
        self.params_with(session_id, self.options())
    }

    /// Parameters for resuming a turn with the options it was first sent with
    pub fn resume_params(
        &self,
        session_id: SessionId,
        options: Option<GenerationOptions>,
    ) -> GenerationParams {
        let options = options.unwrap_or_else(|| self.options());
        self.params_with(session_id, options)
    }

    fn params_with(&self, session_id: SessionId, options: GenerationOptions) -> GenerationParams {
        GenerationParams {
            session_id,
            model_id: self.model_id.clone(),
            kb_id: if self.supports_kb() {
                self.kb_id.clone()
            } else {
                None
            },
            options,
        }
    }
}
