//! Prompt templates with `{{var}}` placeholders.
//!
//! Substitution is a single left-to-right pass, so a value that itself
//! contains `{{...}}` is emitted verbatim and never expanded again.

use std::collections::{BTreeSet, HashMap};
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

/// A named system/user prompt pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate
{   pub name: String
  , pub system_prompt: Option<String>
  , pub user_prompt_template: String
  , /// Names that must be supplied to `render`
    pub variables: BTreeSet<String>
}

impl PromptTemplate
{   /// Required variables are every placeholder found in either prompt.
    pub fn new(
      name: impl Into<String>
    , system_prompt: Option<&str>
    , user_prompt_template: impl Into<String>
    ) -> Self
    {   let user_prompt_template = user_prompt_template.into();
        let mut variables = placeholders(&user_prompt_template);
        if let Some(system) = system_prompt
        {   variables.extend(placeholders(system));
        }
        PromptTemplate
        {   name: name.into()
          , system_prompt: system_prompt.map(str::to_string)
          , user_prompt_template
          , variables
        }
    }

    /// Replace the inferred variable set.
    pub fn with_variables<I, S>(mut self, variables: I) -> Self
    where
      I: IntoIterator<Item = S>
    , S: Into<String>
    {   self.variables = variables.into_iter().map(Into::into).collect();
        self
    }
}

/// Rendered prompts, ready to become messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt
{   pub system_prompt: Option<String>
  , pub user_prompt: String
}

impl RenderedPrompt
{   pub fn into_messages(self) -> Vec<crate::Message>
    {   let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.system_prompt
        {   messages.push(crate::Message::system(system));
        }
        messages.push(crate::Message::user(self.user_prompt));
        messages
    }
}

/// Fails iff some declared variable is missing; extra keys are ignored.
pub fn render(
  template: &PromptTemplate
, variables: &HashMap<String, String>
) -> Result<RenderedPrompt, TemplateError>
{   if let Some(missing) = template.variables
      .iter()
      .find(|name| !variables.contains_key(*name))
    {   return Err(TemplateError::MissingVariable(missing.clone()));
    }

    let fill = |text: &str| substitute(text, &template.variables, variables);
    Ok(RenderedPrompt
    {   system_prompt: template.system_prompt.as_deref().map(fill)
      , user_prompt: fill(&template.user_prompt_template)
    })
}

fn substitute(
  text: &str
, declared: &BTreeSet<String>
, values: &HashMap<String, String>
) -> String
{   let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{")
    {   out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}")
        {   Some(end) => {
              let name = after[..end].trim();
              match values.get(name).filter(|_| declared.contains(name))
              {   Some(value) => out.push_str(value)
                , None => out.push_str(&rest[start..start + 2 + end + 2])
              }
              rest = &after[end + 2..];
            }
          , None => {
              out.push_str(&rest[start..]);
              rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn placeholders(text: &str) -> BTreeSet<String>
{   let mut names = BTreeSet::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{")
    {   let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        let name = after[..end].trim();
        if !name.is_empty()
        {   names.insert(name.to_string());
        }
        rest = &after[end + 2..];
    }
    names
}

/// Registry of predefined and caller-supplied templates
pub struct TemplateEngine
{   templates: RwLock<HashMap<String, PromptTemplate>>
}

impl TemplateEngine
{   /// Empty registry
    pub fn new() -> Self
    {   TemplateEngine
        {   templates: RwLock::new(HashMap::new())
        }
    }

    /// Registry holding the predefined templates
    pub fn with_defaults() -> Self
    {   let engine = TemplateEngine::new();
        for template in predefined()
        {   engine.register(template);
        }
        engine
    }

    /// Add or replace a template by name.
    pub fn register(&self, template: PromptTemplate)
    {   debug!("Registering template: {}", template.name);
        self.templates.write().insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<PromptTemplate>
    {   self.templates.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String>
    {   let mut names: Vec<String>
          = self.templates.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn render(
      &self
    , template: &PromptTemplate
    , variables: &HashMap<String, String>
    ) -> Result<RenderedPrompt, TemplateError>
    {   render(template, variables)
    }

    pub fn render_named(
      &self
    , name: &str
    , variables: &HashMap<String, String>
    ) -> Result<RenderedPrompt, TemplateError>
    {   let template = self.get(name)
          .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?;
        render(&template, variables)
    }
}

impl Default for TemplateEngine
{   fn default() -> Self
    {   TemplateEngine::with_defaults()
    }
}

fn predefined() -> Vec<PromptTemplate>
{   vec![
      PromptTemplate::new(
        "summarize",
        Some("You write concise, faithful summaries."),
        "Summarize the following text:\n\n{{text}}"
      )
    , PromptTemplate::new(
        "translate",
        Some("You are a professional translator. Reply with the translation only."),
        "Translate the following text into {{language}}:\n\n{{text}}"
      )
    , PromptTemplate::new(
        "explain_code",
        Some("You are a patient senior engineer."),
        "Explain what this {{language}} code does:\n\n{{code}}"
      )
    , PromptTemplate::new(
        "proofread",
        Some("You fix grammar and spelling without changing meaning."),
        "Proofread this text and return the corrected version:\n\n{{text}}"
      )
    ]
}
