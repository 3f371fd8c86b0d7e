use std::fmt;

use crate::lexer::Token;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Less,
}

impl Operator {
    pub fn from_token(token: &Token) -> Option<Operator> {
        match token {
            Token::Add => Some(Operator::Add),
            Token::Sub => Some(Operator::Sub),
            Token::Mul => Some(Operator::Mul),
            Token::Div => Some(Operator::Div),
            Token::Less => Some(Operator::Less),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Less => "<",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Prototype {
    pub name: String,
    pub params: Vec<String>,
}

/// A sequence of statements; evaluates to the value of the last one.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Block {
    pub statements: Vec<Node>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Function {
    pub prototype: Prototype,
    pub body: Box<Node>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct If {
    pub condition: Box<Node>,
    pub then_block: Block,
    pub else_block: Option<Block>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Node {
    Number(f64),
    /// A name reference; `line` is where it appears in the source.
    Variable { name: String, line: usize },
    Binary(Operator, Box<Node>, Box<Node>),
    Block(Block),
    Prototype(Prototype),
    Function(Function),
    Call {
        callee: String,
        args: Vec<Node>,
        line: usize,
    },
    If(If),
}

impl Node {
    pub fn number(value: f64) -> Node {
        Node::Number(value)
    }

    pub fn variable(name: impl Into<String>, line: usize) -> Node {
        Node::Variable {
            name: name.into(),
            line,
        }
    }

    pub fn binary(op: Operator, left: Node, right: Node) -> Node {
        Node::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn block(statements: Vec<Node>) -> Node {
        Node::Block(Block { statements })
    }

    pub fn prototype(name: impl Into<String>, params: Vec<String>) -> Node {
        Node::Prototype(Prototype {
            name: name.into(),
            params,
        })
    }

    pub fn function(prototype: Prototype, body: Node) -> Node {
        Node::Function(Function {
            prototype,
            body: Box::new(body),
        })
    }

    pub fn call(callee: impl Into<String>, args: Vec<Node>, line: usize) -> Node {
        Node::Call {
            callee: callee.into(),
            args,
            line,
        }
    }

    pub fn if_else(condition: Node, then_block: Block, else_block: Option<Block>) -> Node {
        Node::If(If {
            condition: Box::new(condition),
            then_block,
            else_block,
        })
    }
}

/// Render a subtree in the parenthesised test form. Leaves and operators stay
/// on one line; blocks, definitions and ifs break their children onto
/// indented lines.
pub fn print(node: &Node) -> String {
    let mut out = String::new();
    write_node(&mut out, node, 0);
    out
}

fn newline(out: &mut String, depth: usize) {
    out.push('\n');
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_block(out: &mut String, block: &Block, depth: usize) {
    out.push_str("(block");
    for statement in &block.statements {
        newline(out, depth + 1);
        write_node(out, statement, depth + 1);
    }
    out.push(')');
}

fn write_prototype(out: &mut String, proto: &Prototype) {
    out.push_str(&format!("(proto {} ({}))", proto.name, proto.params.join(" ")));
}

fn write_node(out: &mut String, node: &Node, depth: usize) {
    match node {
        Node::Number(value) => out.push_str(&format!("(num {:?})", value)),
        Node::Variable { name, .. } => out.push_str(&format!("(var {})", name)),
        Node::Binary(op, left, right) => {
            out.push('(');
            out.push_str(op.symbol());
            out.push(' ');
            write_node(out, left, depth);
            out.push(' ');
            write_node(out, right, depth);
            out.push(')');
        }
        Node::Block(block) => write_block(out, block, depth),
        Node::Prototype(proto) => write_prototype(out, proto),
        Node::Function(function) => {
            out.push_str("(def ");
            write_prototype(out, &function.prototype);
            newline(out, depth + 1);
            write_node(out, &function.body, depth + 1);
            out.push(')');
        }
        Node::Call { callee, args, .. } => {
            out.push_str("(call ");
            out.push_str(callee);
            for arg in args {
                out.push(' ');
                write_node(out, arg, depth);
            }
            out.push(')');
        }
        Node::If(if_node) => {
            out.push_str("(if ");
            write_node(out, &if_node.condition, depth);
            newline(out, depth + 1);
            write_block(out, &if_node.then_block, depth + 1);
            if let Some(else_block) = &if_node.else_block {
                newline(out, depth + 1);
                write_block(out, else_block, depth + 1);
            }
            out.push(')');
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prints_nested_binary_on_one_line() {
        let node = Node::binary(
            Operator::Add,
            Node::number(1.0),
            Node::binary(Operator::Mul, Node::number(2.0), Node::variable("x", 1)),
        );
        assert_eq!(print(&node), "(+ (num 1.0) (* (num 2.0) (var x)))");
    }

    #[test]
    fn prints_definitions_with_indentation() {
        let node = Node::block(vec![
            Node::function(
                Prototype {
                    name: "add".to_string(),
                    params: vec!["a".to_string(), "b".to_string()],
                },
                Node::block(vec![Node::binary(
                    Operator::Add,
                    Node::variable("a", 1),
                    Node::variable("b", 1),
                )]),
            ),
            Node::call("add", vec![Node::number(3.0), Node::number(4.0)], 2),
        ]);
        let expected = "\
(block
  (def (proto add (a b))
    (block
      (+ (var a) (var b))))
  (call add (num 3.0) (num 4.0)))";
        assert_eq!(print(&node), expected);
    }

    #[test]
    fn prints_if_without_else() {
        let node = Node::if_else(
            Node::binary(Operator::Less, Node::number(1.0), Node::number(2.0)),
            Block {
                statements: vec![Node::number(10.0)],
            },
            None,
        );
        assert_eq!(
            node.to_string(),
            "(if (< (num 1.0) (num 2.0))\n  (block\n    (num 10.0)))"
        );
    }

    #[test]
    fn source_lines_are_not_printed() {
        let early = Node::call("f", vec![Node::variable("x", 1)], 1);
        let late = Node::call("f", vec![Node::variable("x", 40)], 40);
        assert_eq!(print(&early), "(call f (var x))");
        assert_eq!(print(&early), print(&late));
        assert_ne!(early, late);
    }

    #[test]
    fn printing_is_deterministic() {
        let node = Node::block(vec![Node::prototype("sin", vec!["x".to_string()])]);
        assert_eq!(print(&node), print(&node));
        assert_eq!(print(&node), "(block\n  (proto sin (x)))");
    }
}
