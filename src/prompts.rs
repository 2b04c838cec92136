//! Centralized prompt definitions for the narrative generator
//!
//! Every prompt asks for a strict output shape; callers still validate the
//! result field by field and fall back when it does not parse.

/// System prompt installed on the narrator pipe.
pub const NARRATOR_SYSTEM_PROMPT: &str = r#"You are the narrator of an interactive, choice-driven role-playing story.
Stay consistent with everything the player has already experienced.
Follow the output format requested in each message exactly and never add commentary outside it."#;

/// Prompt header for the opening scene of a new session.
pub const OPENING_SCENE_PROMPT: &str = r#"Write the opening scene of a new adventure.

Your response MUST be valid JSON in this exact format:
{
  "content": "the scene, 2-4 paragraphs of second-person narration",
  "choices": [
    {
      "text": "a short action the player can take",
      "nextPrompt": "a hint for how the story should continue if chosen",
      "consequences": {}
    }
  ]
}

Guidelines:
- Offer 2-4 meaningfully different choices
- consequences may contain attributeChanges, itemsGained, itemsLost, currencyChange, flagsSet, locationChange

Always respond with valid JSON only, no other text."#;

/// Prompt header for continuing the story after a choice.
pub const CONTINUATION_PROMPT: &str = r#"Continue the story after the player's choice.

Your response MUST be valid JSON in this exact format:
{
  "content": "what happens next, 2-4 paragraphs of second-person narration",
  "choices": [
    {
      "text": "a short action the player can take",
      "nextPrompt": "a hint for how the story should continue if chosen",
      "consequences": {}
    }
  ]
}

Guidelines:
- Show the immediate result of the choice before presenting new options
- Offer 2-4 meaningfully different choices

Always respond with valid JSON only, no other text."#;

/// Prompt header for consequence evaluation.
pub const CONSEQUENCE_EVALUATION_PROMPT: &str = r#"Decide what consequences the player's action will have on the world.

Your response MUST be a valid JSON array in this exact format:
[
  {
    "description": "what will happen as a result of the action",
    "timeToTrigger": "immediate|short|medium|long",
    "severity": "minor|moderate|major|critical",
    "isPermanent": false,
    "affectedEntities": ["names of people, places or factions affected"]
  }
]

Guidelines:
- Return between 1 and 3 consequences
- immediate happens now, short within hours, medium within a day, long within days
- Only mark a consequence permanent if it changes the character for good

Always respond with valid JSON only, no other text."#;

/// Prompt header for danger assessment.
pub const DANGER_LEVEL_PROMPT: &str = r#"Rate how dangerous the current situation is for the player character.

Respond with a single integer from 0 (completely safe) to 10 (almost certainly fatal) and nothing else."#;

/// Prompt header for lethal situation judgement.
pub const LETHAL_SITUATION_PROMPT: &str = r#"Judge whether the player's decision is fatal for the character.

Your response MUST be valid JSON in this exact format:
{
  "shouldDie": false,
  "deathProbability": 0.0,
  "reasoning": "why the decision is or is not lethal",
  "deathDescription": "how the character dies, if they do",
  "lastWords": ["optional final words"]
}

Guidelines:
- deathProbability must be between 0.0 and 1.0
- Be fair: reckless decisions in dangerous situations are lethal, careful ones rarely are

Always respond with valid JSON only, no other text."#;

/// Prompt header for the epitaph written after a permanent death.
pub const EPITAPH_PROMPT: &str = r#"Write a short epitaph (one or two sentences) for a fallen adventurer.

Respond with the epitaph text only."#;
