//! Chess rules behind a narrow trait so the session engine never touches board internals.
//!
//! Positions are full FEN strings. The `chess` crate does not keep the halfmove clock
//! or the fullmove number, so they are carried through the last two FEN fields here.

use std::str::FromStr;

use chess::{BitBoard, Board, BoardStatus, ChessMove, Color, MoveGen, Piece, Square};
use thiserror::Error;

use crate::state::session::{LastMove, Side};

/// Halfmoves without a capture or pawn move after which the game is drawn.
const FIFTY_MOVE_LIMIT: u32 = 100;

/// Occurrences of the same position that draw the game.
const REPETITION_LIMIT: usize = 3;

/// Failures raised while evaluating a position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// Not a FEN the rules engine accepts.
    #[error("invalid position `{position}`")]
    InvalidPosition {
        /// The rejected input.
        position: String,
    },
    /// Not a square name such as `e4`.
    #[error("invalid square `{square}`")]
    InvalidSquare {
        /// The rejected input.
        square: String,
    },
    /// No legal move goes from `from` to `to`.
    #[error("illegal move {from}{to}")]
    IllegalMove {
        /// Origin square.
        from: String,
        /// Destination square.
        to: String,
    },
}

/// Whether a position ends the game by the rules alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Play continues.
    Ongoing,
    /// The side to move is mated.
    Checkmate,
    /// The side to move has no legal move and is not in check.
    Stalemate,
    /// Neither side can deliver mate with the remaining material.
    InsufficientMaterial,
    /// The same position occurred for the third time.
    Repetition,
    /// A hundred halfmoves passed without a capture or pawn move.
    FiftyMove,
}

impl Terminal {
    /// Whether the game is over.
    pub fn is_over(self) -> bool {
        !matches!(self, Terminal::Ongoing)
    }
}

/// Result of applying a legal move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    /// FEN after the move, move counters included.
    pub position: String,
    /// Rule state of the new position.
    pub terminal: Terminal,
    /// Side to play next.
    pub side_to_move: Side,
}

/// Rules contract used by the session state machine.
///
/// `earlier` always lists the positions of the current game that came before the
/// evaluated one, oldest first; repetition is judged against it.
pub trait RulesOracle: Send + Sync {
    /// Standard initial position.
    fn start_position(&self) -> String;
    /// Side to play in `position`.
    fn side_to_move(&self, position: &str) -> Result<Side, OracleError>;
    /// Destination squares reachable from `square` by the side to move.
    fn legal_moves(&self, position: &str, square: &str) -> Result<Vec<String>, OracleError>;
    /// Apply `from → to`, promoting to a queen when the move promotes.
    ///
    /// `earlier` ends with `position` itself.
    fn apply_move(
        &self,
        position: &str,
        from: &str,
        to: &str,
        earlier: &[String],
    ) -> Result<AppliedMove, OracleError>;
    /// Rule state of `position`.
    fn classify(&self, position: &str, earlier: &[String]) -> Result<Terminal, OracleError>;
    /// The legal move leading from `before` to `after`, if there is one.
    fn infer_move(&self, before: &str, after: &str) -> Result<Option<LastMove>, OracleError>;
}

/// [`RulesOracle`] backed by the `chess` crate with FEN positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardChess;

impl RulesOracle for StandardChess {
    fn start_position(&self) -> String {
        Board::default().to_string()
    }

    fn side_to_move(&self, position: &str) -> Result<Side, OracleError> {
        Ok(side(parse_board(position)?.side_to_move()))
    }

    fn legal_moves(&self, position: &str, square: &str) -> Result<Vec<String>, OracleError> {
        let board = parse_board(position)?;
        let source = parse_square(square)?;
        let mut targets: Vec<String> = MoveGen::new_legal(&board)
            .filter(|mv| mv.get_source() == source)
            .map(|mv| mv.get_dest().to_string())
            .collect();
        // Promotions yield one move per piece for the same target.
        targets.dedup();
        Ok(targets)
    }

    fn apply_move(
        &self,
        position: &str,
        from: &str,
        to: &str,
        earlier: &[String],
    ) -> Result<AppliedMove, OracleError> {
        let board = parse_board(position)?;
        let counters = Counters::parse(position)?;
        let source = parse_square(from)?;
        let dest = parse_square(to)?;

        let candidates: Vec<ChessMove> = MoveGen::new_legal(&board)
            .filter(|mv| mv.get_source() == source && mv.get_dest() == dest)
            .collect();
        let chosen = candidates
            .iter()
            .find(|mv| mv.get_promotion() == Some(Piece::Queen))
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| OracleError::IllegalMove {
                from: from.to_owned(),
                to: to.to_owned(),
            })?;

        let next = board.make_move_new(chosen);
        let counters = counters.after(&board, chosen);
        let position = counters.stamp(&next);
        let terminal = terminal_of(&next, counters, repetitions(&position, earlier));
        Ok(AppliedMove {
            position,
            terminal,
            side_to_move: side(next.side_to_move()),
        })
    }

    fn classify(&self, position: &str, earlier: &[String]) -> Result<Terminal, OracleError> {
        let board = parse_board(position)?;
        let counters = Counters::parse(position)?;
        Ok(terminal_of(&board, counters, repetitions(position, earlier)))
    }

    fn infer_move(&self, before: &str, after: &str) -> Result<Option<LastMove>, OracleError> {
        let board = parse_board(before)?;
        let target = repetition_key(after);
        let moving_side = side(board.side_to_move());
        Ok(MoveGen::new_legal(&board)
            .find(|mv| repetition_key(&board.make_move_new(*mv).to_string()) == target)
            .map(|mv| LastMove {
                from: mv.get_source().to_string(),
                to: mv.get_dest().to_string(),
                moving_side,
            }))
    }
}

/// The two trailing FEN fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counters {
    halfmove: u32,
    fullmove: u32,
}

impl Counters {
    /// Read the counters of `position`; absent fields take their initial values.
    fn parse(position: &str) -> Result<Self, OracleError> {
        let invalid = || OracleError::InvalidPosition {
            position: position.to_owned(),
        };
        let mut fields = position.split_whitespace().skip(4);
        let halfmove: u32 = fields.next().map_or(Ok(0), str::parse).map_err(|_| invalid())?;
        let fullmove: u32 = fields.next().map_or(Ok(1), str::parse).map_err(|_| invalid())?;
        Ok(Self { halfmove, fullmove })
    }

    /// Counters after `mv` is played on `board`.
    fn after(self, board: &Board, mv: ChessMove) -> Self {
        let resets = board.piece_on(mv.get_source()) == Some(Piece::Pawn)
            || board.piece_on(mv.get_dest()).is_some();
        Self {
            halfmove: if resets { 0 } else { self.halfmove + 1 },
            fullmove: match board.side_to_move() {
                Color::White => self.fullmove,
                Color::Black => self.fullmove + 1,
            },
        }
    }

    /// FEN of `board` carrying these counters.
    fn stamp(self, board: &Board) -> String {
        format!("{} {} {}", repetition_key(&board.to_string()), self.halfmove, self.fullmove)
    }
}

/// Placement, side to move, castling rights and en-passant square.
fn repetition_key(position: &str) -> String {
    position
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Occurrences of `position` counting itself and every earlier position.
fn repetitions(position: &str, earlier: &[String]) -> usize {
    let key = repetition_key(position);
    1 + earlier
        .iter()
        .filter(|seen| repetition_key(seen) == key)
        .count()
}

fn parse_board(position: &str) -> Result<Board, OracleError> {
    Board::from_str(position).map_err(|_| OracleError::InvalidPosition {
        position: position.to_owned(),
    })
}

fn parse_square(square: &str) -> Result<Square, OracleError> {
    Square::from_str(square).map_err(|_| OracleError::InvalidSquare {
        square: square.to_owned(),
    })
}

fn side(color: Color) -> Side {
    match color {
        Color::White => Side::White,
        Color::Black => Side::Black,
    }
}

fn terminal_of(board: &Board, counters: Counters, repetitions: usize) -> Terminal {
    match board.status() {
        BoardStatus::Checkmate => Terminal::Checkmate,
        BoardStatus::Stalemate => Terminal::Stalemate,
        BoardStatus::Ongoing if insufficient_material(board) => Terminal::InsufficientMaterial,
        BoardStatus::Ongoing if counters.halfmove >= FIFTY_MOVE_LIMIT => Terminal::FiftyMove,
        BoardStatus::Ongoing if repetitions >= REPETITION_LIMIT => Terminal::Repetition,
        BoardStatus::Ongoing => Terminal::Ongoing,
    }
}

/// Bare kings, a single minor piece, or only bishops that all stand on one square colour.
fn insufficient_material(board: &Board) -> bool {
    let others = *board.combined() ^ *board.pieces(Piece::King);
    let bishops = *board.pieces(Piece::Bishop);
    let minors = *board.pieces(Piece::Knight) | bishops;
    match others.popcnt() {
        0 => true,
        1 => others == (others & minors),
        _ => others == bishops && same_square_colour(bishops),
    }
}

fn same_square_colour(squares: BitBoard) -> bool {
    let mut colours = squares.map(|sq| (sq.get_rank().to_index() + sq.get_file().to_index()) % 2);
    match colours.next() {
        Some(first) => colours.all(|colour| colour == first),
        None => true,
    }
}
