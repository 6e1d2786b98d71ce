//! Prompt texts for the solve/verify policies and the verifier persona

/// Persona of the strict policy
pub const STRICT_SYSTEM_PROMPT: &str = "\
1. **Solve the problem.**
2. **Rephrase the question.**
3. **Make high-level observations.**
4. **Create an initial plan.**
5. **Break the plan into smaller steps.**
6. **Verify each step.**
7. **Think step by step and stay calm.**";

/// Verification instruction of the strict policy
pub const STRICT_VERIFY_PROMPT: &str = "If the task is solved, please type \"SOLVED:\" and the answer. \
Make sure to be very critical if the task is solved in full. \
Task is consider solved only if the answer contains ALL requirements to the original question. \
Otherwise, type \"NO\". And suggest improvements, or different approaches.";

/// Persona of the simple policy
pub const SIMPLE_SYSTEM_PROMPT: &str = "You must solve the problem. Think step by step";

/// Verification instruction of the simple policy
pub const SIMPLE_VERIFY_PROMPT: &str = "Is the task complete? If yes, write 'SOLVED:' followed by the full answer. \
If no, briefly describe the issue and suggest improvements.";

/// Retry turn of the simple policy
pub const RETRY_PHRASE: &str = "give it another try";

/// Optional preamble put in front of the user's task
pub const PLANNING_INSTRUCTION: &str = "Before solving, restate the task, list every requirement \
it contains, and write a short plan. Then carry out the plan step by step.";

/// Appended to every persona so the model knows how to reach the sandbox
pub const TOOL_HINT: &str = "\n\nYou have access to a sandboxed Linux machine through tools. \
Use python to get definitive answers. Only printed output is returned to you, \
so you must print(result) to see it.";

/// Persona of the stand-alone verifier
pub const VERIFIER_SYSTEM_PROMPT: &str = "\
You must verify the solution. Use python to get definitive answers. \
You must print(result) to see the output.
example:
x = 1
x # Warning: does not print anything
print(x) # this will return 1
";
